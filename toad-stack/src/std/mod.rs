use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embedded_time::duration::Milliseconds;
use embedded_time::rate::Fraction;

use crate::time::{Millis, Task, TimerHandle};

/// Implement [`embedded_time::Clock`] using [`std::time`] primitives
#[derive(Debug, Clone, Copy)]
pub struct Clock(std::time::Instant);

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock {
  /// Create a new clock
  pub fn new() -> Self {
    Self(std::time::Instant::now())
  }

  /// Time elapsed since the clock was created
  pub fn millis(&self) -> Millis {
    use embedded_time::Clock as _;

    self.try_now()
        .ok()
        .and_then(|now| Millis::try_from(now.duration_since_epoch()).ok())
        .unwrap_or(Milliseconds(0))
  }
}

impl embedded_time::Clock for Clock {
  type T = u64;

  // microseconds
  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

  fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
    let now = std::time::Instant::now();
    let elapsed = now.duration_since(self.0);
    Ok(embedded_time::Instant::new(elapsed.as_micros() as u64))
  }
}

struct Entry {
  due: u64,
  seq: u64,
  timer: TimerHandle,
  task: Task,
}

impl Entry {
  fn key(&self) -> (u64, u64) {
    (self.due, self.seq)
  }
}

// BinaryHeap is a max-heap; earliest due (then earliest scheduled) first
impl Ord for Entry {
  fn cmp(&self, other: &Self) -> Ordering {
    other.key().cmp(&self.key())
  }
}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Entry {
  fn eq(&self, other: &Self) -> bool {
    self.key() == other.key()
  }
}

impl Eq for Entry {}

#[derive(Default)]
struct Queue {
  heap: BinaryHeap<Entry>,
  seq: u64,
  shutdown: bool,
}

#[derive(Default)]
struct Shared {
  queue: Mutex<Queue>,
  wake: Condvar,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, Queue> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// [`Scheduler`](crate::time::Scheduler) running tasks on a dedicated timer thread.
///
/// Tasks run one at a time, in order of due time; the thread stops
/// when the scheduler is dropped.
///
/// ```
/// use std::sync::mpsc;
///
/// use embedded_time::duration::Milliseconds;
/// use toad_stack::std::Scheduler;
/// use toad_stack::time::Scheduler as _;
///
/// let sched = Scheduler::new();
/// let (tx, rx) = mpsc::channel();
/// sched.after(Milliseconds(5u64), Box::new(move || tx.send(()).unwrap()));
/// rx.recv().unwrap();
/// ```
pub struct Scheduler {
  clock: Clock,
  shared: Arc<Shared>,
  worker: Option<JoinHandle<()>>,
}

impl Scheduler {
  /// Start the timer thread
  pub fn new() -> Self {
    let clock = Clock::new();
    let shared = Arc::new(Shared::default());

    let worker = {
      let shared = shared.clone();
      thread::Builder::new().name("toad-timer".into())
                            .spawn(move || run(&shared, clock))
    };

    if let Err(e) = worker.as_ref() {
      log::error!("could not start timer thread: {}", e);
    }

    Self { clock,
           shared,
           worker: worker.ok() }
  }

  /// Stop the timer thread; tasks still pending never run
  pub fn shutdown(&self) {
    self.shared.lock().shutdown = true;
    self.shared.wake.notify_all();
  }
}

fn run(shared: &Shared, clock: Clock) {
  let mut queue = shared.lock();

  loop {
    if queue.shutdown {
      return;
    }

    let now = clock.millis().0;
    match queue.heap.peek().map(|e| e.due) {
      | Some(due) if due <= now => {
        let entry = queue.heap.pop();
        drop(queue);

        if let Some(entry) = entry.filter(|e| !e.timer.is_cancelled()) {
          (entry.task)();
        }

        queue = shared.lock();
      },
      | Some(due) => {
        let wait = Duration::from_millis(due - now);
        queue = shared.wake
                      .wait_timeout(queue, wait)
                      .map(|(q, _)| q)
                      .unwrap_or_else(|e| e.into_inner().0);
      },
      | None => {
        queue = shared.wake
                      .wait(queue)
                      .unwrap_or_else(|e| e.into_inner());
      },
    }
  }
}

impl Default for Scheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl crate::time::Scheduler for Scheduler {
  fn now(&self) -> Millis {
    self.clock.millis()
  }

  fn schedule(&self, timer: TimerHandle, delay: Millis, task: Task) {
    let due = self.clock.millis().0.saturating_add(delay.0);
    let mut queue = self.shared.lock();
    queue.seq += 1;
    let seq = queue.seq;
    queue.heap.push(Entry { due,
                            seq,
                            timer,
                            task });
    drop(queue);
    self.shared.wake.notify_one();
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    self.shutdown();

    if let Some(worker) = self.worker.take() {
      // the last handle can be dropped by a task on the timer thread itself
      if worker.thread().id() != thread::current().id() {
        worker.join().ok();
      }
    }
  }
}

impl core::fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let pending = self.shared.lock().heap.len();
    f.debug_struct("Scheduler")
     .field("now", &self.clock.millis())
     .field("pending", &pending)
     .finish()
  }
}
