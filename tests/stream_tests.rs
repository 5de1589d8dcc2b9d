//! Queue ordering, events, sticky errors and graph replay

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mlpforge::backend::DeviceError;
use mlpforge::{DeviceEvent, DeviceStream, QueueId};

#[test]
fn test_event_orders_work_across_queues() -> anyhow::Result<()> {
    let stream = DeviceStream::with_aux_queues(&common::DEVICE, 2)?;
    let ready = DeviceEvent::new();
    let flag = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(AtomicBool::new(false));

    let writer = Arc::clone(&flag);
    stream.launch(QueueId::Aux(1), "slow_writer", move || {
        std::thread::sleep(Duration::from_millis(30));
        writer.store(true, Ordering::SeqCst);
        Ok(())
    })?;
    stream.record_event(&ready, QueueId::Aux(1))?;
    stream.wait_event(&ready, QueueId::Primary)?;

    let (reader, sink) = (Arc::clone(&flag), Arc::clone(&seen));
    stream.launch(QueueId::Primary, "reader", move || {
        sink.store(reader.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    })?;
    stream.synchronize()?;

    assert!(seen.load(Ordering::SeqCst));
    assert!(ready.query()?);
    Ok(())
}

#[test]
fn test_wait_on_unrecorded_event_is_noop() -> anyhow::Result<()> {
    let stream = common::stream()?;
    let never = DeviceEvent::new();
    stream.wait_event(&never, QueueId::Primary)?;
    stream.wait_event(&never, QueueId::Aux(0))?;
    stream.synchronize()?;
    Ok(())
}

#[test]
fn test_first_error_is_sticky() -> anyhow::Result<()> {
    let stream = common::stream()?;
    let ran_after = Arc::new(AtomicBool::new(false));

    stream.launch(QueueId::Primary, "broken", || {
        Err(DeviceError::execution("broken", "bad input"))
    })?;
    stream.launch(QueueId::Primary, "also_broken", || {
        Err(DeviceError::execution("also_broken", "later failure"))
    })?;
    let flag = Arc::clone(&ran_after);
    stream.launch(QueueId::Primary, "after", move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    })?;

    for _ in 0..2 {
        match stream.synchronize() {
            Err(DeviceError::ExecutionFailed { kernel, .. }) => assert_eq!(kernel, "broken"),
            other => panic!("expected the first failure, got {:?}", other),
        }
    }
    assert!(matches!(
        stream.last_error()?,
        Some(DeviceError::ExecutionFailed { .. })
    ));
    assert!(!ran_after.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_missing_queue_is_rejected() -> anyhow::Result<()> {
    let stream = DeviceStream::new(&common::DEVICE)?;
    assert_eq!(stream.aux_queue_count(), 0);
    assert!(!stream.has_queue(QueueId::Aux(0)));
    let result = stream.launch(QueueId::Aux(0), "nowhere", || Ok(()));
    assert!(matches!(result, Err(DeviceError::QueueError(_))));
    Ok(())
}

#[test]
fn test_graph_replay_reruns_recorded_ops() -> anyhow::Result<()> {
    let stream = common::stream()?;
    let counter = Arc::new(AtomicUsize::new(0));
    let done = DeviceEvent::new();

    let ((), graph) = stream.capture(|s| -> Result<(), DeviceError> {
        let c = Arc::clone(&counter);
        s.launch(QueueId::Aux(0), "bump", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        s.record_event(&done, QueueId::Aux(0))?;
        s.wait_event(&done, QueueId::Primary)?;
        let c = Arc::clone(&counter);
        s.launch(QueueId::Primary, "double", move || {
            let v = c.load(Ordering::SeqCst);
            c.store(v * 2, Ordering::SeqCst);
            Ok(())
        })
    })?;
    stream.synchronize()?;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(graph.launch_count(), 2);
    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.queue_count(), 2);

    stream.launch_graph(&graph)?;
    stream.synchronize()?;
    assert_eq!(counter.load(Ordering::SeqCst), 6);
    stream.launch_graph(&graph)?;
    stream.synchronize()?;
    assert_eq!(counter.load(Ordering::SeqCst), 14);
    Ok(())
}

#[test]
fn test_capture_rules() -> anyhow::Result<()> {
    let stream = common::stream()?;
    let nested = stream.capture(|s| s.capture(|_| Ok::<(), DeviceError>(())).map(|_| ()));
    assert!(matches!(nested, Err(DeviceError::CaptureError(_))));

    let sync = stream.capture(|s| s.synchronize());
    assert!(matches!(sync, Err(DeviceError::CaptureError(_))));
    assert!(!stream.is_capturing()?);

    let ((), mut graph) = stream.capture(|s| s.launch(QueueId::Primary, "noop", || Ok(())))?;
    graph.invalidate();
    assert!(matches!(
        stream.launch_graph(&graph),
        Err(DeviceError::CaptureError(_))
    ));

    // A graph that used the aux queue cannot run on a stream without one
    let ((), wide) = stream.capture(|s| s.launch(QueueId::Aux(0), "noop", || Ok(())))?;
    let narrow = DeviceStream::new(&common::DEVICE)?;
    assert!(narrow.launch_graph(&wide).is_err());
    stream.synchronize()?;
    Ok(())
}

#[test]
fn test_elapsed_time_between_events() -> anyhow::Result<()> {
    let stream = common::stream()?;
    let (start, stop) = (DeviceEvent::new(), DeviceEvent::new());
    stream.record_event(&start, QueueId::Primary)?;
    stream.launch(QueueId::Primary, "sleep", || {
        std::thread::sleep(Duration::from_millis(20));
        Ok(())
    })?;
    stream.record_event(&stop, QueueId::Primary)?;
    stop.synchronize()?;

    let ms = start.elapsed_time(&stop)?;
    assert!(ms >= 15.0, "elapsed {} ms", ms);
    Ok(())
}
