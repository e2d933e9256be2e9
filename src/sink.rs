//! Single-consumer observer hooks for diagnostics: raw inbound lines, raw
//! outbound lines, and connection errors. The engine only ever calls
//! [`Sink::offer`], which must not block; the bundled [`QueueSink`] hands
//! values to a dedicated consumer thread so a slow user callback cannot
//! stall the reactor.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

const QUEUE_DEPTH: usize = 1024;

/// Non-blocking observer hook. Values may be dropped when the consumer
/// cannot keep up; ordering of delivered values matches offer order.
pub trait Sink<T>: Send + Sync {
    fn offer(&self, value: T);
}

/// Sink backed by a bounded queue drained by a dedicated consumer thread.
/// The thread exits once every handle to the sink has been dropped.
pub struct QueueSink<T> {
    tx: Sender<T>,
}

impl<T: Send + 'static> QueueSink<T> {
    /// Spawn a consumer thread running `consume` for every offered value.
    pub fn spawn<F>(name: &str, mut consume: F) -> Arc<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        thread::Builder::new()
            .name(format!("tether-sink-{}", name))
            .spawn(move || {
                for value in rx {
                    consume(value);
                }
            })
            .expect("spawn sink consumer thread");
        Arc::new(QueueSink { tx })
    }

    /// Sink plus the receiving end of its queue, with no consumer thread.
    /// Intended for tests and for callers that want to drain on their own
    /// schedule.
    pub fn channel() -> (Arc<Self>, Receiver<T>) {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        (Arc::new(QueueSink { tx }), rx)
    }
}

impl<T: Send> Sink<T> for QueueSink<T> {
    fn offer(&self, value: T) {
        let _ = self.tx.try_send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn delivers_in_order() {
        let (sink, rx) = QueueSink::channel();
        for i in 0..10 {
            sink.offer(i);
        }
        let got: Vec<i32> = rx.try_iter().collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn consumer_thread_runs_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sink = QueueSink::spawn("test", move |_: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..5 {
            sink.offer(i);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
