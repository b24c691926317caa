use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::{FuyuzoraError, Result};

/// Handle to a block body rendering on a worker thread.
pub struct PendingBlock {
    label: String,
    receiver: mpsc::Receiver<Result<String>>,
}

/// Run `work` on a worker thread, returning a handle joined later at a
/// synchronization point. The worker renders into a private buffer; once
/// dispatched it cannot be cancelled.
pub fn spawn_block(
    label: impl Into<String>,
    work: impl FnOnce() -> Result<String> + Send + 'static,
) -> Result<PendingBlock> {
    let label = label.into();
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name(format!("fuyuzora-{}", label))
        .spawn(move || {
            let _ = sender.send(work());
        })
        .map_err(|e| FuyuzoraError::DeferredJoin {
            label: label.clone(),
            message: format!("failed to spawn worker: {}", e),
        })?;
    Ok(PendingBlock { label, receiver })
}

enum Part {
    Ready(String),
    Pending(PendingBlock),
}

/// Ordered output parts of one render scope.
///
/// Synchronous writes append to the tail; a deferred block inserts a pending
/// part in place. `finish` joins every pending part in document order, so the
/// final text is byte-for-byte what a synchronous render would have produced
/// regardless of worker completion order.
#[derive(Default)]
pub struct OutputChain {
    parts: Vec<Part>,
}

impl OutputChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, text: &str) {
        if let Some(Part::Ready(tail)) = self.parts.last_mut() {
            tail.push_str(text);
        } else {
            self.parts.push(Part::Ready(text.to_string()));
        }
    }

    pub fn push_pending(&mut self, block: PendingBlock) {
        self.parts.push(Part::Pending(block));
    }

    /// Collect the final text, blocking on each pending part in order with a
    /// bounded per-join timeout. A timed-out or failed worker aborts the
    /// render.
    pub fn finish(self, timeout: Duration) -> Result<String> {
        let mut out = String::new();
        for part in self.parts {
            match part {
                Part::Ready(text) => out.push_str(&text),
                Part::Pending(block) => match block.receiver.recv_timeout(timeout) {
                    Ok(Ok(text)) => out.push_str(&text),
                    Ok(Err(e)) => return Err(e),
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(FuyuzoraError::DeferredJoin {
                            label: block.label,
                            message: format!("join timed out after {:?}", timeout),
                        });
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(FuyuzoraError::DeferredJoin {
                            label: block.label,
                            message: "worker exited without a result".to_string(),
                        });
                    }
                },
            }
        }
        Ok(out)
    }
}

impl fmt::Write for OutputChain {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.push_str(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_synchronous_writes_concatenate() {
        let mut chain = OutputChain::new();
        chain.push_str("a");
        chain.push_str("b");
        chain.push_str("c");
        assert_eq!(chain.finish(TIMEOUT).unwrap(), "abc");
    }

    #[test]
    fn test_document_order_survives_completion_order() {
        let mut chain = OutputChain::new();
        chain.push_str("start ");
        // The first block finishes last.
        let slow = spawn_block("slow", || {
            thread::sleep(Duration::from_millis(100));
            Ok("slow".to_string())
        })
        .unwrap();
        chain.push_pending(slow);
        chain.push_str(" mid ");
        let fast = spawn_block("fast", || Ok("fast".to_string())).unwrap();
        chain.push_pending(fast);
        chain.push_str(" end");
        assert_eq!(chain.finish(TIMEOUT).unwrap(), "start slow mid fast end");
    }

    #[test]
    fn test_worker_failure_is_fatal() {
        let mut chain = OutputChain::new();
        let failing = spawn_block("boom", || {
            Err(FuyuzoraError::TypeError {
                message: "boom".to_string(),
            })
        })
        .unwrap();
        chain.push_pending(failing);
        let err = chain.finish(TIMEOUT).unwrap_err();
        assert!(matches!(err, FuyuzoraError::TypeError { .. }));
    }

    #[test]
    fn test_join_timeout_is_fatal() {
        let mut chain = OutputChain::new();
        let stuck = spawn_block("stuck", || {
            thread::sleep(Duration::from_secs(2));
            Ok(String::new())
        })
        .unwrap();
        chain.push_pending(stuck);
        let err = chain.finish(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FuyuzoraError::DeferredJoin { .. }));
    }
}
