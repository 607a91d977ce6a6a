use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};

pub type BoxedJob<T> = Box<dyn FnOnce() -> T + Send + 'static>;

struct Job<T> {
    index: usize,
    run: BoxedJob<T>,
}

enum Message<T> {
    Admitted(usize),
    Completed(usize, T),
}

/// Lifecycle notifications delivered on the calling thread, in the order the
/// workers produced them.
#[derive(Debug)]
pub enum PoolEvent<'a, T> {
    /// A worker took job `index` off the queue and is about to run it.
    Admitted { index: usize },
    /// Job `index` returned. Its worker slot is free again.
    Completed { index: usize, output: &'a T },
}

/// Run `jobs` on at most `max_parallel` worker threads.
///
/// Only `min(max_parallel, jobs.len())` workers exist, so the bound holds by
/// construction. Outputs come back in job order.
pub fn run_bounded<T: Send + 'static>(
    max_parallel: usize,
    jobs: Vec<BoxedJob<T>>,
) -> Result<Vec<T>> {
    run_bounded_with_events(max_parallel, jobs, |_| {})
}

/// Like [`run_bounded`], calling `on_event` on the calling thread for every
/// admission and completion as it happens. The calling thread is the only
/// consumer, so `on_event` needs no synchronization of its own.
pub fn run_bounded_with_events<T, F>(
    max_parallel: usize,
    jobs: Vec<BoxedJob<T>>,
    mut on_event: F,
) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: FnMut(PoolEvent<'_, T>),
{
    if max_parallel == 0 {
        return Err(anyhow!("max_parallel must be >= 1"));
    }
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let expected_count = jobs.len();
    let worker_count = max_parallel.min(expected_count);
    let queue: VecDeque<Job<T>> = jobs
        .into_iter()
        .enumerate()
        .map(|(index, run)| Job { index, run })
        .collect();

    let queue = Arc::new(Mutex::new(queue));
    let (tx, rx) = mpsc::channel::<Message<T>>();

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || loop {
            let job = {
                let mut q = match queue.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                q.pop_front()
            };
            let Some(job) = job else {
                break;
            };
            if tx.send(Message::Admitted(job.index)).is_err() {
                break;
            }
            let out = (job.run)();
            if tx.send(Message::Completed(job.index, out)).is_err() {
                break;
            }
        }));
    }
    drop(tx);

    let mut out: Vec<(usize, T)> = Vec::with_capacity(expected_count);
    for msg in rx {
        match msg {
            Message::Admitted(index) => on_event(PoolEvent::Admitted { index }),
            Message::Completed(index, value) => {
                on_event(PoolEvent::Completed {
                    index,
                    output: &value,
                });
                out.push((index, value));
            }
        }
    }

    for h in handles {
        if h.join().is_err() {
            return Err(anyhow!("bounded executor worker panicked"));
        }
    }

    if out.len() != expected_count {
        return Err(anyhow!(
            "bounded executor output count mismatch (expected {expected_count}, got {})",
            out.len()
        ));
    }

    out.sort_by_key(|(idx, _)| *idx);
    Ok(out.into_iter().map(|(_, v)| v).collect())
}
