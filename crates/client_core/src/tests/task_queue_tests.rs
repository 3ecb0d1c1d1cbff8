use super::*;
use std::sync::{Arc, Mutex};
use tokio::time::sleep;

#[tokio::test]
async fn operations_run_in_submission_order_without_overlap() {
    let queue = SerializedTaskQueue::new(Duration::from_secs(5));
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mark = |log: &Arc<Mutex<Vec<String>>>, label: &str| {
        let log = Arc::clone(log);
        let label = label.to_string();
        async move {
            log.lock().expect("log").push(format!("start {label}"));
            sleep(Duration::from_millis(20)).await;
            log.lock().expect("log").push(format!("end {label}"));
            Ok(label)
        }
    };

    let (a, b, c) = tokio::join!(
        queue.submit(mark(&log, "a")),
        queue.submit(mark(&log, "b")),
        queue.submit(mark(&log, "c")),
    );
    assert_eq!(a.expect("a"), "a");
    assert_eq!(b.expect("b"), "b");
    assert_eq!(c.expect("c"), "c");

    let log = log.lock().expect("log");
    assert_eq!(
        log.as_slice(),
        [
            "start a", "end a", "start b", "end b", "start c", "end c"
        ]
    );
}

#[tokio::test]
async fn one_failure_does_not_abort_the_rest() {
    let queue = SerializedTaskQueue::new(Duration::from_secs(5));

    let (first, second) = tokio::join!(
        queue.submit(async { Err::<&str, _>(anyhow!("backend said no")) }),
        queue.submit(async { Ok("still ran") }),
    );

    assert!(first.is_err());
    assert_eq!(second.expect("second"), "still ran");
}

#[tokio::test]
async fn hung_operation_is_rejected_at_the_deadline_and_queue_moves_on() {
    let queue = SerializedTaskQueue::new(Duration::from_millis(50));

    let (hung, next) = tokio::join!(
        queue.submit(async {
            futures::future::pending::<()>().await;
            Ok("unreachable")
        }),
        queue.submit(async { Ok("after the stall") }),
    );

    let err = hung.expect_err("deadline");
    assert!(err.to_string().contains("deadline"));
    assert_eq!(next.expect("next"), "after the stall");
}

#[tokio::test]
async fn queue_keeps_working_after_a_burst() {
    let queue = SerializedTaskQueue::new(Duration::from_secs(1));

    for round in 0..10 {
        let result = queue.submit(async move { Ok(round) }).await.expect("round");
        assert_eq!(result, round);
    }
}
