mod common;

use common::TestError;
use fetchgate::{GovernanceError, Priority, PriorityRequestQueue};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn waiting_operations_dispatch_by_priority_then_arrival() {
    let queue = PriorityRequestQueue::new(1);
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the only slot so the rest queue up.
    let blocker = {
        let gate = gate.clone();
        queue.enqueue(
            move || async move {
                gate.notified().await;
                Ok::<_, GovernanceError<TestError>>(())
            },
            Priority::HIGH,
        )
    };

    let handles: Vec<_> = [(5, "first 5"), (1, "1"), (5, "second 5"), (3, "3")]
        .into_iter()
        .map(|(priority, label)| {
            let order = order.clone();
            queue.enqueue(
                move || async move {
                    order.lock().unwrap().push(label);
                    Ok::<_, GovernanceError<TestError>>(())
                },
                priority,
            )
        })
        .collect();
    assert_eq!(queue.queue_size(), 4);

    gate.notify_one();
    blocker.await.unwrap();
    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["first 5", "second 5", "3", "1"]);
}

#[tokio::test(start_paused = true)]
async fn active_count_never_exceeds_the_cap() {
    let queue = PriorityRequestQueue::new(4);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let running = running.clone();
            let peak = peak.clone();
            let observer = queue.clone();
            queue.enqueue(
                move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(observer.active_count() <= 4);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, GovernanceError<TestError>>(())
                },
                0,
            )
        })
        .collect();

    assert_eq!(queue.active_count(), 4);
    assert_eq!(queue.queue_size(), 6);
    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 4);
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test]
async fn clear_queue_fails_waiters_and_spares_the_active_one() {
    let queue = PriorityRequestQueue::new(1);
    let gate = Arc::new(Notify::new());
    let active = {
        let gate = gate.clone();
        queue.enqueue(
            move || async move {
                gate.notified().await;
                Ok::<_, GovernanceError<TestError>>("done")
            },
            0,
        )
    };
    let waiting: Vec<_> = (0..3)
        .map(|_| queue.enqueue(|| async { Ok::<_, GovernanceError<TestError>>("never") }, 0))
        .collect();

    assert_eq!(queue.clear_queue(), 3);
    assert_eq!(queue.queue_size(), 0);
    for result in join_all(waiting).await {
        assert!(result.unwrap_err().is_queue_cleared());
    }

    gate.notify_one();
    assert_eq!(active.await.unwrap(), "done");
}
