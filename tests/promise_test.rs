#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use promise_pipe::promise::Producer;
    use promise_pipe::Error;
    use std::sync::{Arc, Barrier};
    use std::{thread, time::Duration};

    #[test]
    fn test_resolve_then_reject() {
        let (promise, consumer) = Producer::<i32, String>::new();

        assert_eq!(promise.resolve(1), Ok(()));
        assert_eq!(promise.reject("some error".into()), Err(Error::AlreadySettled));
        assert_eq!(block_on(consumer.value()), 1);
        assert_eq!(*block_on(consumer).unwrap(), Ok(1));
    }

    #[test]
    fn test_reject_then_resolve() {
        let (promise, consumer) = Producer::<i32, String>::new();

        assert_eq!(promise.reject("some error".into()), Ok(()));
        assert_eq!(promise.resolve(1), Err(Error::AlreadySettled));
        assert_eq!(block_on(consumer.err()), "some error");
        assert_eq!(*block_on(consumer).unwrap(), Err("some error".to_string()));
    }

    #[test]
    fn test_every_observer_sees_the_value() {
        let (promise, consumer) = Producer::<String, ()>::new();
        let waiting: Vec<_> = (0..8)
            .map(|_| {
                let consumer = consumer.clone();
                thread::spawn(move || block_on(consumer.value()))
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        promise.resolve("🍓".into()).unwrap();

        for task in waiting {
            assert_eq!(task.join().expect("The consumer thread has panicked"), "🍓");
        }
        // Late observers see it too.
        assert_eq!(block_on(consumer.value()), "🍓");
        assert_eq!(block_on(promise.consumer().value()), "🍓");
    }

    #[test]
    fn test_concurrent_resolve_has_one_winner() {
        const PRODUCERS: usize = 16;
        let (promise, consumer) = Producer::<usize, ()>::new();
        let barrier = Barrier::new(PRODUCERS);

        let results: Vec<_> = thread::scope(|s| {
            let tasks: Vec<_> = (0..PRODUCERS)
                .map(|i| {
                    let (promise, barrier) = (&promise, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        (i, promise.resolve(i))
                    })
                })
                .collect();
            tasks
                .into_iter()
                .map(|task| task.join().expect("The producer thread has panicked"))
                .collect()
        });

        let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter(|(_, r)| r.is_err())
            .all(|(_, r)| *r == Err(Error::AlreadySettled)));
        assert_eq!(block_on(consumer.value()), winners[0].0);
    }

    #[test]
    fn test_concurrent_resolve_and_reject() {
        let (promise, consumer) = Producer::<u8, u8>::new();
        let promise = Arc::new(promise);
        let barrier = Arc::new(Barrier::new(2));

        let tasks: Vec<_> = [true, false]
            .into_iter()
            .map(|resolve| {
                let (promise, barrier) = (promise.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    if resolve {
                        promise.resolve(1)
                    } else {
                        promise.reject(2)
                    }
                })
            })
            .collect();
        let results: Vec<_> = tasks
            .into_iter()
            .map(|task| task.join().expect("The producer thread has panicked"))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let outcome = block_on(consumer).unwrap();
        if results[0].is_ok() {
            assert_eq!(*outcome, Ok(1));
        } else {
            assert_eq!(*outcome, Err(2));
        }
    }

    #[tokio::test]
    async fn test_err_never_completes_after_resolve() {
        let (promise, consumer) = Producer::<&str, &str>::new();
        promise.resolve("Hello World!").unwrap();

        let err = tokio::time::timeout(Duration::from_millis(20), consumer.err()).await;
        assert!(err.is_err());
        assert_eq!(consumer.value().await, "Hello World!");
    }

    #[tokio::test]
    async fn test_race_against_timeout() {
        let (promise, consumer) = Producer::<String, String>::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            promise.reject("some error".into()).unwrap();
        });

        let received = tokio::select! {
            value = consumer.value() => format!("Received {value:?}."),
            err = consumer.err() => format!("Received an error: {err}."),
            _ = tokio::time::sleep(Duration::from_secs(1)) => "Timed out.".to_string(),
        };
        assert_eq!(received, "Received an error: some error.");
    }

    #[tokio::test]
    async fn test_abandoned_promise() {
        let (promise, consumer) = Producer::<String, String>::new();
        let waiting = tokio::spawn(consumer.clone());

        tokio::task::yield_now().await;
        drop(promise);

        let outcome = waiting.await.expect("The consumer task has panicked");
        assert_eq!(outcome.unwrap_err(), Error::ProducerDropped);
        assert!(!consumer.is_settled());
    }
}
