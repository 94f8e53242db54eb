use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{future::Future, pin::Pin, task::{Context, Poll, Waker}};
use crate::Error;

/// The settling half of a promise.
///
/// A `Producer` resolves or rejects the promise once. It is not `Clone`:
/// when several tasks race to settle the same promise, share it by reference
/// or through an `Arc`. The first call wins, every later one gets
/// [`Error::AlreadySettled`].
///
/// Dropping the producer of a pending promise abandons it, and awaiting a
/// [`Consumer`] then fails with [`Error::ProducerDropped`].
///
/// # Examples
///
/// ```
/// use promise_pipe::promise::Producer;
/// use promise_pipe::Error;
/// use futures::executor::block_on;
/// use std::thread;
/// let (promise, consumer) = Producer::<String, String>::new();
/// let consumer2 = consumer.clone();
/// let task1 = thread::spawn(move || block_on(consumer.value()));
/// let task2 = thread::spawn(move || block_on(consumer2.value()));
/// assert_eq!(promise.resolve("Hi".into()), Ok(()));
/// assert_eq!(promise.reject("too late".into()), Err(Error::AlreadySettled));
/// assert_eq!(task1.join().expect("The task1 thread has panicked."), "Hi");
/// assert_eq!(task2.join().expect("The task2 thread has panicked."), "Hi");
/// ```
pub struct Producer<T, E> {
    promise: Arc<Mutex<Inner<T, E>>>,
}

/// The observing half of a promise.
///
/// Consumers are cheap to clone and every clone sees the same outcome.
/// Awaiting a consumer yields the whole outcome; [`value`](Consumer::value)
/// and [`err`](Consumer::err) each wait for one side only.
pub struct Consumer<T, E> {
    registration: Registration<T, E>,
}

enum State<T, E> {
    Pending,
    Settled(Arc<Result<T, E>>),
    Abandoned,
}

struct Inner<T, E> {
    state: State<T, E>,
    // Keyed by observer so a dropped future can take its waker back out.
    wakers: HashMap<u64, Waker>,
    next_key: u64,
}

impl<T, E> Inner<T, E> {
    fn lock(promise: &Mutex<Self>) -> MutexGuard<'_, Self> {
        // Nothing panics while the lock is held, so a poisoned state is intact.
        promise.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leaves the pending state and hands back the wakers to notify.
    fn settle(&mut self, state: State<T, E>) -> Result<Vec<Waker>, Error> {
        if !matches!(self.state, State::Pending) {
            return Err(Error::AlreadySettled);
        }
        self.state = state;
        Ok(self.wakers.drain().map(|(_, waker)| waker).collect())
    }
}

impl<T, E> Producer<T, E> {
    /// Creates a pending promise.
    ///
    /// Returns the producer together with a first consumer. More consumers
    /// come from cloning it or from [`Producer::consumer`].
    pub fn new() -> (Self, Consumer<T, E>) {
        let producer = Self {
            promise: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                wakers: HashMap::new(),
                next_key: 0,
            })),
        };
        let consumer = producer.consumer();
        (producer, consumer)
    }

    /// Settles the promise with a value, unless it is settled already.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_pipe::promise::Producer;
    /// use futures::executor::block_on;
    /// use std::thread;
    /// let (op, op_a) = Producer::<String, ()>::new();
    /// let task1 = thread::spawn(move || block_on(op_a));
    /// let task2 = thread::spawn(move || op.resolve(String::from("🍓")));
    /// assert_eq!(task2.join().expect("The task2 thread has panicked"), Ok(()));
    /// let outcome = task1.join().expect("The task1 thread has panicked");
    /// assert_eq!(*outcome.unwrap(), Ok(String::from("🍓")));
    /// ```
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.settle(Ok(value))
    }

    /// Settles the promise with an error, unless it is settled already.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_pipe::promise::Producer;
    /// use futures::executor::block_on;
    /// use std::thread;
    /// let (op, op_a) = Producer::<(), String>::new();
    /// let task1 = thread::spawn(move || block_on(op_a.err()));
    /// op.reject(String::from("💥")).unwrap();
    /// assert_eq!(task1.join().expect("The task1 thread has panicked"), "💥");
    /// ```
    pub fn reject(&self, err: E) -> Result<(), Error> {
        self.settle(Err(err))
    }

    /// Returns a new consumer of this promise.
    pub fn consumer(&self) -> Consumer<T, E> {
        Consumer {
            registration: Registration::new(self.promise.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(Inner::lock(&self.promise).state, State::Settled(_))
    }

    fn settle(&self, outcome: Result<T, E>) -> Result<(), Error> {
        let resolved = outcome.is_ok();
        let wakers = Inner::lock(&self.promise).settle(State::Settled(Arc::new(outcome)))?;
        tracing::trace!(resolved, waiters = wakers.len(), "promise settled");
        for waker in wakers {
            waker.wake()
        }
        Ok(())
    }
}

impl<T, E> Drop for Producer<T, E> {
    /// If this is an unsettled producer, wake the consumers with an error.
    fn drop(&mut self) {
        let wakers = Inner::lock(&self.promise).settle(State::Abandoned);
        if let Ok(wakers) = wakers {
            tracing::debug!(waiters = wakers.len(), "promise abandoned by its producer");
            for waker in wakers {
                waker.wake()
            }
        }
    }
}

impl<T, E> fmt::Debug for Producer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T, E> Consumer<T, E> {
    /// Waits for a resolved value.
    ///
    /// The returned future never completes if the promise is rejected or
    /// abandoned; race it against [`err`](Consumer::err) or a timeout, or
    /// await the consumer itself to get either outcome.
    pub fn value(&self) -> Value<T, E> {
        Value {
            registration: Registration::new(self.registration.promise.clone()),
        }
    }

    /// Waits for a rejection. Never completes if the promise is resolved or
    /// abandoned.
    pub fn err(&self) -> Failure<T, E> {
        Failure {
            registration: Registration::new(self.registration.promise.clone()),
        }
    }

    /// Returns the outcome if the promise is settled, without waiting.
    pub fn try_outcome(&self) -> Option<Arc<Result<T, E>>> {
        match &Inner::lock(&self.registration.promise).state {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending | State::Abandoned => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.try_outcome().is_some()
    }
}

impl<T, E> Clone for Consumer<T, E> {
    fn clone(&self) -> Self {
        Self {
            registration: Registration::new(self.registration.promise.clone()),
        }
    }
}

impl<T, E> fmt::Debug for Consumer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T, E> Future for Consumer<T, E> {
    type Output = Result<Arc<Result<T, E>>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.registration.poll_outcome(cx)
    }
}

/// Future returned by [`Consumer::value`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Value<T, E> {
    registration: Registration<T, E>,
}

impl<T: Clone, E> Future for Value<T, E> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.registration.poll_outcome(cx) {
            Poll::Ready(Ok(outcome)) => match &*outcome {
                Ok(value) => Poll::Ready(value.clone()),
                Err(_) => Poll::Pending,
            },
            // Rejected or abandoned: nothing will ever wake this future.
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Consumer::err`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Failure<T, E> {
    registration: Registration<T, E>,
}

impl<T, E: Clone> Future for Failure<T, E> {
    type Output = E;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.registration.poll_outcome(cx) {
            Poll::Ready(Ok(outcome)) => match &*outcome {
                Err(err) => Poll::Ready(err.clone()),
                Ok(_) => Poll::Pending,
            },
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

/// One observer's slot in the promise's waker table.
struct Registration<T, E> {
    promise: Arc<Mutex<Inner<T, E>>>,
    key: Option<u64>,
}

impl<T, E> Registration<T, E> {
    fn new(promise: Arc<Mutex<Inner<T, E>>>) -> Self {
        Self { promise, key: None }
    }

    fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<Result<Arc<Result<T, E>>, Error>> {
        let mut promise = Inner::lock(&self.promise);
        match &promise.state {
            State::Settled(outcome) => Poll::Ready(Ok(outcome.clone())),
            State::Abandoned => Poll::Ready(Err(Error::ProducerDropped)),
            State::Pending => {
                let key = match self.key {
                    Some(key) => key,
                    None => {
                        let key = promise.next_key;
                        promise.next_key += 1;
                        self.key = Some(key);
                        key
                    }
                };
                match promise.wakers.get_mut(&key) {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    Some(waker) => waker.clone_from(cx.waker()),
                    None => {
                        promise.wakers.insert(key, cx.waker().clone());
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> Drop for Registration<T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            Inner::lock(&self.promise).wakers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use std::thread;
    use std::task::{Context, Poll};
    use std::future::Future;
    use std::pin::Pin;
    use futures::task::noop_waker;
    use super::{Inner, Producer};
    use crate::Error;

    #[test]
    fn test_resolve_wakes_value_waiter() {
        let (op, op_a) = Producer::<String, ()>::new();
        let task1 = thread::spawn(move || {
            block_on(async {
                op_a.value().await
            })
        });
        let task2 = thread::spawn(move || {
            block_on(async {
                op.resolve(String::from("🍓"))
            })
        });
        assert_eq!(task1.join().expect("The task1 thread has panicked"), "🍓");
        assert_eq!(task2.join().expect("The task2 thread has panicked"), Ok(()));
    }

    #[test]
    fn test_two_consumers_see_resolve() {
        let (op, op_a) = Producer::<String, ()>::new();
        let op_b = op_a.clone();
        let task1 = thread::spawn(move || {
            block_on(async {
                op_a.await
            })
        });
        let task2 = thread::spawn(move || {
            block_on(async {
                op_b.await
            })
        });
        let task3 = thread::spawn(move || {
            block_on(async {
                op.resolve(String::from("🍓"))
            })
        });
        for task in [task1, task2] {
            let outcome = task.join().expect("The consumer thread has panicked").unwrap();
            assert_eq!(*outcome, Ok(String::from("🍓")));
        }
        assert_eq!(task3.join().expect("The task3 thread has panicked"), Ok(()));
    }

    #[test]
    fn test_reject_wakes_err_waiter() {
        let (a, b) = Producer::<String, String>::new();
        let task1 = thread::spawn(move || {
            block_on(async {
                b.err().await
            })
        });
        let task2 = thread::spawn(move || {
            block_on(async {
                a.reject(String::from("reject!!"))
            })
        });
        assert_eq!(task1.join().expect("The task1 thread has panicked"), "reject!!");
        assert_eq!(task2.join().expect("The task2 thread has panicked"), Ok(()));
    }

    #[test]
    fn test_promise_resolve_twice() {
        let (a, b) = Producer::<String, ()>::new();
        assert_eq!(a.resolve("hi".into()), Ok(()));
        assert_eq!(a.resolve("again".into()), Err(Error::AlreadySettled));
        assert_eq!(a.reject(()), Err(Error::AlreadySettled));
        assert_eq!(block_on(b.value()), "hi");
    }

    #[test]
    fn test_dropped_producer_abandons() {
        let (op, op_a) = Producer::<String, String>::new();
        let task1 = thread::spawn(move || {
            block_on(async {
                op_a.await
            })
        });
        let task2 = thread::spawn(move || {
            // Ensure we move the producer into this thread but we never resolve
            // it.
            std::mem::drop(op);
        });
        task2.join().expect("The task2 thread has panicked");
        let outcome = task1.join().expect("The task1 thread has panicked");
        assert_eq!(outcome.unwrap_err(), Error::ProducerDropped);
    }

    #[test]
    fn test_value_pending_after_reject() {
        let (op, op_a) = Producer::<String, String>::new();
        op.reject("nope".into()).unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut value = op_a.value();
        assert!(Pin::new(&mut value).poll(&mut cx).is_pending());
        let mut err = op_a.err();
        assert_eq!(Pin::new(&mut err).poll(&mut cx), Poll::Ready(String::from("nope")));
    }

    #[test]
    fn test_dropped_observer_releases_waker() {
        let (op, op_a) = Producer::<u32, ()>::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        for _ in 0..16 {
            let mut value = op_a.value();
            assert!(Pin::new(&mut value).poll(&mut cx).is_pending());
            assert!(Pin::new(&mut value).poll(&mut cx).is_pending());
        }
        assert!(Inner::lock(&op.promise).wakers.is_empty());

        let mut value = op_a.value();
        assert!(Pin::new(&mut value).poll(&mut cx).is_pending());
        assert_eq!(Inner::lock(&op.promise).wakers.len(), 1);
        op.resolve(7).unwrap();
        assert!(Inner::lock(&op.promise).wakers.is_empty());
        assert_eq!(Pin::new(&mut value).poll(&mut cx), Poll::Ready(7));
    }

    #[test]
    fn test_try_outcome() {
        let (op, op_a) = Producer::<u32, ()>::new();
        assert!(op_a.try_outcome().is_none());
        assert!(!op.is_settled());
        op.resolve(3).unwrap();
        assert!(op.is_settled());
        assert!(op.consumer().is_settled());
        assert_eq!(*op_a.try_outcome().unwrap(), Ok(3));
    }
}
