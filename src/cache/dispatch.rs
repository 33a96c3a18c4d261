use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use failure::{Error, Fail};
use log::warn;

use crate::cache::coalesce::coalesce;
use crate::cache::common::*;

#[derive(Debug, Fail)]
enum DispatchError {
    #[fail(display = "dispatcher is shut down")]
    ShutDown,
}

type CoalesceCallback = Box<dyn FnOnce(Result<Vec<CoalesceContext>, Error>) + Send + 'static>;

struct Job {
    stack: Vec<PhrasematchSubquery>,
    opts: CoalesceOpts,
    callback: CoalesceCallback,
}

/// Owns the worker pool coalesce requests run on. A request's subqueries
/// carry shared handles on their caches; the job holds those handles
/// until its callback has returned, so a caller can't free a store while
/// a worker is still reading it.
pub struct Dispatcher {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new() -> Result<Self, Error> {
        Dispatcher::with_workers(num_cpus::get())
    }

    pub fn with_workers(count: usize) -> Result<Self, Error> {
        let (sender, receiver) = unbounded::<Job>();
        let count = std::cmp::max(count, 1);
        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("coalesce-{}", worker_id))
                .spawn(move || {
                    for job in receiver.iter() {
                        let result = coalesce(job.stack, &job.opts);
                        if let Err(error) = &result {
                            warn!("coalesce failed: {}", error);
                        }
                        (job.callback)(result);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Dispatcher { sender: Some(sender), workers })
    }

    /// Validates the request synchronously, then runs coalesce on a
    /// worker. The callback fires exactly once, with either the ranked
    /// contexts or the worker-side error.
    pub fn coalesce<F>(
        &self,
        stack: Vec<PhrasematchSubquery>,
        opts: CoalesceOpts,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Result<Vec<CoalesceContext>, Error>) + Send + 'static,
    {
        validate(&stack, &opts)?;
        let sender = self.sender.as_ref().ok_or(DispatchError::ShutDown)?;
        sender
            .send(Job { stack, opts, callback: Box::new(callback) })
            .map_err(|_| DispatchError::ShutDown)?;
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // closing the channel lets workers drain outstanding jobs and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn validate(stack: &[PhrasematchSubquery], opts: &CoalesceOpts) -> Result<(), Error> {
    if stack.is_empty() {
        return Err(InputError::EmptyStack.into());
    }
    for subquery in stack {
        if subquery.phrase.is_empty() {
            return Err(InputError::EmptyPhrase.into());
        }
        if !(subquery.weight >= 0. && subquery.weight <= 1.) {
            return Err(InputError::InvalidWeight { weight: subquery.weight }.into());
        }
    }
    if !opts.radius.is_finite()
        || opts.radius < 0.
        || opts.radius > f64::from(std::u32::MAX)
    {
        return Err(InputError::InvalidRadius { radius: opts.radius }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::encode_grid;
    use crate::cache::memory::MemoryCache;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    fn subquery(cache: Arc<MemoryCache>) -> PhrasematchSubquery {
        PhrasematchSubquery {
            cache: CacheRef::Memory(cache),
            weight: 1.,
            phrase: "main st".to_string(),
            prefix: PrefixMatch::Disabled,
            idx: 1,
            zoom: 14,
            mask: 1,
            langfield: ALL_LANGUAGES,
        }
    }

    fn grid(relev: f64, score: u16, x: u16, y: u16, id: u32) -> u64 {
        encode_grid(&MatchEntry {
            grid_entry: GridEntry { relev, score, x, y, id },
            matches_language: false,
        })
    }

    #[test]
    fn rejects_bad_input_synchronously() {
        let dispatcher = Dispatcher::with_workers(1).unwrap();

        let result = dispatcher.coalesce(vec![], CoalesceOpts::default(), |_| {
            panic!("callback must not run for invalid input")
        });
        assert!(result.is_err());

        let cache = Arc::new(MemoryCache::new());

        let mut empty_phrase = subquery(cache.clone());
        empty_phrase.phrase = String::new();
        assert!(dispatcher
            .coalesce(vec![empty_phrase], CoalesceOpts::default(), |_| panic!("no callback"))
            .is_err());

        let mut heavy = subquery(cache.clone());
        heavy.weight = 2.;
        assert!(dispatcher
            .coalesce(vec![heavy], CoalesceOpts::default(), |_| panic!("no callback"))
            .is_err());

        let opts = CoalesceOpts { radius: std::f64::NAN, ..CoalesceOpts::default() };
        assert!(dispatcher
            .coalesce(vec![subquery(cache)], opts, |_| panic!("no callback"))
            .is_err());
    }

    #[test]
    fn delivers_results_through_the_callback() {
        let mut cache = MemoryCache::new();
        cache.set("main st", &[grid(1., 3, 10, 10, 7), grid(0.8, 1, 11, 11, 8)], ALL_LANGUAGES, false);
        let cache = Arc::new(cache);

        let dispatcher = Dispatcher::with_workers(2).unwrap();
        let (tx, rx) = mpsc::channel();

        dispatcher
            .coalesce(vec![subquery(cache)], CoalesceOpts::default(), move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();

        let contexts = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].entries[0].grid_entry.id, 7);
        assert_eq!(contexts[0].entries[0].tmp_id, (1 << 25) + 7);
        assert_eq!(contexts[1].entries[0].grid_entry.id, 8);
    }

    #[test]
    fn caches_stay_pinned_until_the_callback_runs() {
        let mut cache = MemoryCache::new();
        cache.set("main st", &[grid(1., 3, 10, 10, 7)], ALL_LANGUAGES, false);
        let cache = Arc::new(cache);

        let dispatcher = Dispatcher::with_workers(1).unwrap();
        let (tx, rx) = mpsc::channel();

        dispatcher
            .coalesce(vec![subquery(cache.clone())], CoalesceOpts::default(), move |result| {
                tx.send(result.map(|contexts| contexts.len())).unwrap();
            })
            .unwrap();

        // dropping the caller's handle must not invalidate the job's
        drop(cache);
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap(), 1);
    }
}
