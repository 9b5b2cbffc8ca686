#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use embedded_time::duration::Milliseconds;
use no_std_net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use toad_stem::Stem;

use crate::config::{self, Config};
use crate::exchange::{Deliverer, Exchange, Origin, Outbox};
use crate::layer::Stack;
use crate::msg::{self, EmptyMessage, Id, Type};
use crate::req::Request;
use crate::resp::Response;
use crate::time::{Millis, Scheduler, Task, TimerHandle};

pub fn init_logger() {
  simple_logger::init_with_level(log::Level::Trace).ok();
}

pub fn addr() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 5683))
}

/// A CON GET from [`addr`] with the given ID and token
pub fn con_request(id: u16, token: u32) -> Request {
  let mut req = Request::get("hello");
  req.msg_mut().ty = Some(Type::Con);
  req.msg_mut().id = Some(Id(id));
  req.msg_mut().token = Some(msg::token_from_u32(token));
  req.msg_mut().source = Some(addr());
  req
}

/// An exchange whose outbox and deliverer discard everything
pub fn exchange(origin: Origin) -> Exchange {
  Exchange::new(origin,
                Milliseconds(0),
                Arc::new(RecordingOutbox::default()),
                Arc::new(RecordingDeliverer::default()))
}

struct Pending {
  due: u64,
  seq: u64,
  timer: TimerHandle,
  task: Task,
}

#[derive(Default)]
struct Timeline {
  now: u64,
  seq: u64,
  queue: Vec<Pending>,
  scheduled: Vec<Millis>,
}

/// Scheduler driven by the test: time only moves on [`ManualScheduler::advance`]
#[derive(Default)]
pub struct ManualScheduler(Mutex<Timeline>);

impl ManualScheduler {
  fn timeline<R>(&self, f: impl FnOnce(&mut Timeline) -> R) -> R {
    let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
  }

  /// Move time forward by `ms`, running every task that comes due
  /// in order of due time, then scheduling order
  pub fn advance(&self, ms: u64) {
    let target = self.timeline(|t| t.now) + ms;

    loop {
      let due = self.timeline(|t| {
                      t.queue.retain(|p| !p.timer.is_cancelled());
                      let ix = t.queue
                                .iter()
                                .enumerate()
                                .filter(|(_, p)| p.due <= target)
                                .min_by_key(|(_, p)| (p.due, p.seq))
                                .map(|(ix, _)| ix)?;
                      let p = t.queue.remove(ix);
                      t.now = t.now.max(p.due);
                      Some(p)
                    });

      match due {
        | Some(p) if !p.timer.is_cancelled() => (p.task)(),
        | Some(_) => continue,
        | None => break,
      }
    }

    self.timeline(|t| t.now = target);
  }

  /// Run everything due now
  pub fn run_pending(&self) {
    self.advance(0)
  }

  /// Number of live (uncancelled) tasks
  pub fn pending(&self) -> usize {
    self.timeline(|t| t.queue.iter().filter(|p| !p.timer.is_cancelled()).count())
  }

  /// Every delay ever scheduled, in order
  pub fn scheduled(&self) -> Vec<Millis> {
    self.timeline(|t| t.scheduled.clone())
  }
}

impl Scheduler for ManualScheduler {
  fn now(&self) -> Millis {
    Milliseconds(self.timeline(|t| t.now))
  }

  fn schedule(&self, timer: TimerHandle, delay: Millis, task: Task) {
    self.timeline(|t| {
          t.seq += 1;
          t.scheduled.push(delay);
          t.queue.push(Pending { due: t.now + delay.0,
                                 seq: t.seq,
                                 timer,
                                 task });
        })
  }
}

impl core::fmt::Debug for ManualScheduler {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let (now, pending) = self.timeline(|t| (t.now, t.queue.len()));
    f.debug_struct("ManualScheduler")
     .field("now", &now)
     .field("pending", &pending)
     .finish()
  }
}

#[derive(Debug, Clone)]
pub enum Sent {
  Request(Request),
  Response(Response),
  Empty(EmptyMessage),
}

/// Outbox remembering everything that left the bottom of the stack
#[derive(Debug, Default)]
pub struct RecordingOutbox(Stem<Vec<Sent>>);

impl RecordingOutbox {
  pub fn sent(&self) -> Vec<Sent> {
    self.0.map_ref(|s| s.clone())
  }

  pub fn requests(&self) -> Vec<Request> {
    self.sent()
        .into_iter()
        .filter_map(|s| match s {
          | Sent::Request(r) => Some(r),
          | _ => None,
        })
        .collect()
  }

  pub fn responses(&self) -> Vec<Response> {
    self.sent()
        .into_iter()
        .filter_map(|s| match s {
          | Sent::Response(r) => Some(r),
          | _ => None,
        })
        .collect()
  }

  pub fn empties(&self) -> Vec<EmptyMessage> {
    self.sent()
        .into_iter()
        .filter_map(|s| match s {
          | Sent::Empty(e) => Some(e),
          | _ => None,
        })
        .collect()
  }

  pub fn clear(&self) {
    self.0.map_mut(|s| s.clear());
  }

  fn push(&self, sent: Sent) {
    let mut sent = Some(sent);
    self.0.map_mut(|s| s.extend(sent.take()));
  }
}

impl Outbox for RecordingOutbox {
  fn send_request(&self, _: &Exchange, request: Request) {
    self.push(Sent::Request(request))
  }

  fn send_response(&self, _: &Exchange, response: Response) {
    self.push(Sent::Response(response))
  }

  fn send_empty_message(&self, _: &Exchange, message: EmptyMessage) {
    self.push(Sent::Empty(message))
  }
}

/// Deliverer remembering everything that left the top of the stack
#[derive(Debug, Default)]
pub struct RecordingDeliverer {
  requests: Stem<Vec<Request>>,
  responses: Stem<Vec<Response>>,
}

impl RecordingDeliverer {
  pub fn requests(&self) -> Vec<Request> {
    self.requests.map_ref(|r| r.clone())
  }

  pub fn responses(&self) -> Vec<Response> {
    self.responses.map_ref(|r| r.clone())
  }
}

impl Deliverer for RecordingDeliverer {
  fn deliver_request(&self, exchange: &Exchange) {
    let mut req = exchange.request();
    self.requests.map_mut(|r| r.extend(req.take()));
  }

  fn deliver_response(&self, _: &Exchange, response: Response) {
    let mut resp = Some(response);
    self.responses.map_mut(|r| r.extend(resp.take()));
  }
}

/// A stack wired to a manual clock and recording transport / application ends
#[derive(Debug)]
pub struct Harness {
  pub stack: Stack,
  pub config: config::Shared,
  pub scheduler: Arc<ManualScheduler>,
  pub outbox: Arc<RecordingOutbox>,
  pub deliverer: Arc<RecordingDeliverer>,
}

impl Harness {
  /// A stack with only its sentinels; tests add the layers they need
  pub fn new(config: Config) -> Self {
    init_logger();
    Self { stack: Stack::empty(),
           config: config::Shared::new(config),
           scheduler: Default::default(),
           outbox: Default::default(),
           deliverer: Default::default() }
  }

  /// The complete observe / blockwise / token / reliability stack
  pub fn full(config: Config) -> Self {
    let mut h = Self::new(config);
    h.stack = Stack::new(h.config.clone(), h.dyn_scheduler()).unwrap();
    h
  }

  pub fn dyn_scheduler(&self) -> Arc<dyn Scheduler> {
    self.scheduler.clone()
  }

  pub fn now(&self) -> Millis {
    self.scheduler.now()
  }

  pub fn advance(&self, ms: u64) {
    self.scheduler.advance(ms)
  }

  pub fn exchange(&self, origin: Origin) -> Exchange {
    Exchange::new(origin,
                  self.now(),
                  self.outbox.clone(),
                  self.deliverer.clone())
  }
}
