use std::{
  fs, io,
  sync::{Arc, Condvar, Mutex, MutexGuard},
  thread,
  time::Duration,
};

use log::error;

use crate::records::{timestamp_ms, MemoryRecord};
use crate::tracker::{RecursionGuard, Tracker};
use crate::writer::RecordWriter;

/// Periodic resident-set-size sampler.
///
/// A single worker wakes every `interval`, reads RSS from the OS and writes
/// a memory record through the shared writer (and its mutex; there is no
/// separate channel). Any failure deactivates tracking and ends the worker.
pub(crate) struct BackgroundSampler {
  shared: Arc<SamplerShared>,
  worker: Option<thread::JoinHandle<()>>,
}

struct SamplerShared {
  stop: Mutex<bool>,
  wakeup: Condvar,
}

impl BackgroundSampler {
  /// Spawn the worker. Fails if RSS cannot be read at startup or the
  /// thread cannot be spawned.
  pub(crate) fn start(writer: Arc<RecordWriter>, interval: Duration) -> io::Result<Self> {
    let page_size = page_size();

    // Surface an unreadable statm synchronously instead of from the worker.
    read_rss(page_size)?;

    let shared = Arc::new(SamplerShared {
      stop: Mutex::new(false),
      wakeup: Condvar::new(),
    });

    let worker_shared = Arc::clone(&shared);
    let worker = thread::Builder::new()
      .name("heaptrail-rss".to_string())
      .spawn(move || {
        // The worker's own allocations must never be traced.
        RecursionGuard::set_for_current_thread(true);

        loop {
          {
            let stop = lock_stop(&worker_shared.stop);
            let Ok((stop, _timeout)) = worker_shared.wakeup.wait_timeout(stop, interval)
            else {
              break;
            };
            if *stop {
              break;
            }
          }

          let Ok(rss) = read_rss(page_size) else {
            error!("failed to read RSS, deactivating tracking");
            Tracker::deactivate();
            break;
          };

          let record = MemoryRecord {
            rss,
            ms_since_epoch: timestamp_ms(),
          };
          if writer.write_memory_record(record).is_err() {
            error!("failed to write output, deactivating tracking");
            Tracker::deactivate();
            break;
          }
        }
      })?;

    Ok(Self {
      shared,
      worker: Some(worker),
    })
  }

  /// Signal the worker and wait for it to exit.
  pub(crate) fn stop(mut self) {
    {
      let mut stop = lock_stop(&self.shared.stop);
      *stop = true;
      self.shared.wakeup.notify_one();
    }

    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

fn lock_stop(stop: &Mutex<bool>) -> MutexGuard<'_, bool> {
  match stop.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn page_size() -> u64 {
  // SAFETY: sysconf has no preconditions.
  let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  value.max(1) as u64
}

fn read_rss(page_size: u64) -> io::Result<u64> {
  let statm = fs::read_to_string("/proc/self/statm")?;
  parse_rss(&statm, page_size)
    .ok_or_else(|| io::Error::other("malformed /proc/self/statm"))
}

/// The second whitespace-separated field of statm is the resident page
/// count.
fn parse_rss(statm: &str, page_size: u64) -> Option<u64> {
  statm
    .split_whitespace()
    .nth(1)?
    .parse::<u64>()
    .ok()
    .map(|pages| pages * page_size)
}
