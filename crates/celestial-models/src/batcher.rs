//! Batching of concurrent synthesis calls that share every parameter but the text.

use celestial_abstraction::{ModelError, SynthesisOutput};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Runs one batched backend call over the combined texts.
///
/// Executed on the blocking pool. Must return exactly one waveform per text, in order.
pub type BatchFn = Arc<dyn Fn(Vec<String>) -> Result<SynthesisOutput, ModelError> + Send + Sync>;

type Reply = oneshot::Sender<Result<SynthesisOutput, ModelError>>;

/// A caller waiting for its slice of a batch.
struct Pending {
    texts: Vec<String>,
    run: BatchFn,
    reply: Reply,
}

struct Queue<K> {
    /// Groups in arrival order of their first request.
    groups: Vec<(K, Vec<Pending>)>,
    running: bool,
}

/// Collects concurrent synthesis requests and runs compatible ones as one call.
///
/// The first request to arrive while nothing is running starts a drain task that
/// keeps executing queued groups until the queue is empty. Later requests enqueue
/// and wait. The drain task is detached from every caller, so a caller that stops
/// waiting never stalls the others.
pub struct InferenceBatcher<K> {
    queue: Arc<Mutex<Queue<K>>>,
}

impl<K> InferenceBatcher<K>
where
    K: PartialEq + Debug + Send + Sync + 'static,
{
    /// Creates an idle batcher.
    #[must_use]
    pub fn new() -> Self {
        Self { queue: Arc::new(Mutex::new(Queue { groups: Vec::new(), running: false })) }
    }

    fn lock(queue: &Mutex<Queue<K>>) -> MutexGuard<'_, Queue<K>> {
        queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits `texts` under `key` and waits for this caller's waveforms.
    ///
    /// Requests with equal keys that are queued together are merged; `run` of the
    /// first request in the group executes the merged call.
    ///
    /// # Errors
    /// Returns the batch's `ModelError` if the merged call fails; every request in
    /// that batch receives the same error.
    pub async fn submit(
        &self,
        key: K,
        texts: Vec<String>,
        run: BatchFn,
    ) -> Result<SynthesisOutput, ModelError> {
        let (reply, receiver) = oneshot::channel();
        let pending = Pending { texts, run, reply };

        let start_leader = {
            let mut queue = Self::lock(&self.queue);
            match queue.groups.iter_mut().find(|(group_key, _)| *group_key == key) {
                Some((_, group)) => group.push(pending),
                None => queue.groups.push((key, vec![pending])),
            }
            !std::mem::replace(&mut queue.running, true)
        };

        if start_leader {
            tokio::spawn(Self::drain(Arc::clone(&self.queue)));
        }

        receiver.await.map_err(|_| {
            ModelError::Inference("batch worker ended without a result".to_string())
        })?
    }

    /// Number of requests waiting to run.
    #[must_use]
    pub fn queued(&self) -> usize {
        Self::lock(&self.queue).groups.iter().map(|(_, group)| group.len()).sum()
    }

    async fn drain(queue: Arc<Mutex<Queue<K>>>) {
        loop {
            let next = {
                let mut guard = Self::lock(&queue);
                if guard.groups.is_empty() {
                    guard.running = false;
                    None
                } else {
                    Some(guard.groups.remove(0))
                }
            };
            let Some((key, group)) = next else {
                return;
            };
            Self::execute(&key, group).await;
        }
    }

    async fn execute(key: &K, group: Vec<Pending>) {
        let started = Instant::now();
        let requests = group.len();
        let counts: Vec<usize> = group.iter().map(|pending| pending.texts.len()).collect();
        let total: usize = counts.iter().sum();

        let mut texts = Vec::with_capacity(total);
        let mut replies = Vec::with_capacity(requests);
        let mut run = None;
        for pending in group {
            texts.extend(pending.texts);
            replies.push(pending.reply);
            run.get_or_insert(pending.run);
        }
        let Some(run) = run else {
            return;
        };

        debug!(key = ?key, requests, texts = total, "Running batched inference");

        let result = tokio::task::spawn_blocking(move || run(texts))
            .await
            .unwrap_or_else(|e| Err(ModelError::Inference(format!("batch task panicked: {e}"))))
            .and_then(|output| {
                if output.wavs.len() == total {
                    Ok(output)
                } else {
                    Err(ModelError::Inference(format!(
                        "batch returned {} waveforms for {total} texts",
                        output.wavs.len()
                    )))
                }
            });

        match result {
            Ok(SynthesisOutput { wavs, sample_rate }) => {
                let mut wavs = wavs.into_iter();
                for (reply, count) in replies.into_iter().zip(counts) {
                    let slice = wavs.by_ref().take(count).collect();
                    let _ = reply.send(Ok(SynthesisOutput { wavs: slice, sample_rate }));
                }
                debug!(
                    key = ?key,
                    requests,
                    duration_ms = started.elapsed().as_millis(),
                    "Batched inference complete"
                );
            }
            Err(err) => {
                warn!(key = ?key, requests, error = %err, "Batched inference failed");
                for reply in replies {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
    }
}

impl<K> Default for InferenceBatcher<K>
where
    K: PartialEq + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debug for InferenceBatcher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceBatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Produces one waveform per text whose single sample is the text length.
    #[allow(clippy::cast_precision_loss)]
    fn echo(calls: Arc<AtomicUsize>, delay: Duration) -> BatchFn {
        Arc::new(move |texts: Vec<String>| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(delay);
            Ok::<_, ModelError>(SynthesisOutput {
                wavs: texts.iter().map(|t| vec![t.len() as f32]).collect(),
                sample_rate: 16_000,
            })
        })
    }

    #[tokio::test]
    async fn test_single_request_gets_its_output() {
        let batcher = InferenceBatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let output = batcher
            .submit("k", vec!["ab".to_string(), "abcd".to_string()], echo(Arc::clone(&calls), Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(output.wavs, vec![vec![2.0], vec![4.0]]);
        assert_eq!(output.sample_rate, 16_000);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.queued(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_sliced_per_caller() {
        let batcher = Arc::new(InferenceBatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        // Occupies the worker so the following requests queue up behind it.
        let first = {
            let batcher = Arc::clone(&batcher);
            let run = echo(Arc::clone(&calls), Duration::from_millis(150));
            tokio::spawn(async move { batcher.submit("k", vec!["x".to_string()], run).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut followers = Vec::new();
        for len in 1..=4 {
            let batcher = Arc::clone(&batcher);
            let run = echo(Arc::clone(&calls), Duration::ZERO);
            let texts = vec!["y".repeat(len), "z".repeat(len * 10)];
            followers.push(tokio::spawn(async move { batcher.submit("k", texts, run).await }));
        }

        first.await.unwrap().unwrap();
        for (i, follower) in followers.into_iter().enumerate() {
            let len = (i + 1) as f32;
            let output = follower.await.unwrap().unwrap();
            assert_eq!(output.wavs, vec![vec![len], vec![len * 10.0]]);
        }
        // One call for the leader, one merged call for the four followers.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_keys_are_not_merged() {
        let batcher = Arc::new(InferenceBatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let blocker = {
            let batcher = Arc::clone(&batcher);
            let run = echo(Arc::clone(&calls), Duration::from_millis(100));
            tokio::spawn(async move { batcher.submit("a", vec!["x".to_string()], run).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let b = batcher.submit("b", vec!["bb".to_string()], echo(Arc::clone(&calls), Duration::ZERO));
        let c = batcher.submit("c", vec!["ccc".to_string()], echo(Arc::clone(&calls), Duration::ZERO));
        let (b, c) = tokio::join!(b, c);

        assert_eq!(b.unwrap().wavs, vec![vec![2.0]]);
        assert_eq!(c.unwrap().wavs, vec![vec![3.0]]);
        blocker.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_fans_out_to_whole_batch() {
        let batcher = Arc::new(InferenceBatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let failing: BatchFn = Arc::new(|_texts: Vec<String>| {
            Err::<SynthesisOutput, _>(ModelError::Inference("out of memory".to_string()))
        });

        let blocker = {
            let batcher = Arc::clone(&batcher);
            let run = echo(Arc::clone(&calls), Duration::from_millis(100));
            tokio::spawn(async move { batcher.submit("k", vec!["x".to_string()], run).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let one = batcher.submit("bad", vec!["a".to_string()], Arc::clone(&failing));
        let two = batcher.submit("bad", vec!["b".to_string()], Arc::clone(&failing));
        let (one, two) = tokio::join!(one, two);

        let expected = Err(ModelError::Inference("out of memory".to_string()));
        assert_eq!(one, expected);
        assert_eq!(two, expected);
        assert!(blocker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wrong_waveform_count_is_an_error() {
        let batcher = InferenceBatcher::new();
        let short: BatchFn = Arc::new(|_texts: Vec<String>| {
            Ok::<_, ModelError>(SynthesisOutput { wavs: vec![vec![0.0]], sample_rate: 8_000 })
        });

        let result = batcher.submit(1_u8, vec!["a".to_string(), "b".to_string()], short).await;
        assert!(matches!(result, Err(ModelError::Inference(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abandoned_caller_does_not_stall_others() {
        let batcher = Arc::new(InferenceBatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let abandoned = {
            let batcher = Arc::clone(&batcher);
            let run = echo(Arc::clone(&calls), Duration::from_millis(100));
            tokio::spawn(async move { batcher.submit("k", vec!["x".to_string()], run).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();

        let output = tokio::time::timeout(
            Duration::from_secs(5),
            batcher.submit("k", vec!["abc".to_string()], echo(Arc::clone(&calls), Duration::ZERO)),
        )
        .await
        .expect("follower stalled")
        .unwrap();

        assert_eq!(output.wavs, vec![vec![3.0]]);
    }
}
