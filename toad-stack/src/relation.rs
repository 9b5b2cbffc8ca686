use std::sync::Arc;

use no_std_net::SocketAddr;
use toad_stem::Stem;

use crate::config;
use crate::exchange::{Exchange, WeakExchange};
use crate::resp::Response;
use crate::time::Millis;

/// Decides when a notification must be sent CON so that
/// an observer that went away is eventually noticed.
pub trait FreshnessCheck: Send + Sync + core::fmt::Debug {
  /// Invoked once for every successful notification; yields `true` when this one should be CON
  fn check(&self, now: Millis) -> bool;
}

/// Forces a CON notification when [`check_interval`](config::Observe::check_interval)
/// has passed since the last one, or on every
/// [`check_interval_count`](config::Observe::check_interval_count)th notification.
///
/// ```
/// use embedded_time::duration::Milliseconds;
/// use toad_stack::config::Shared;
/// use toad_stack::relation::{FreshnessCheck, IntervalCheck};
///
/// let config = Shared::default();
/// config.update(|c| c.observe.check_interval_count = 3);
///
/// let check = IntervalCheck::new(config, Milliseconds(0));
/// let checks = (0..6).map(|_| check.check(Milliseconds(10))).collect::<Vec<_>>();
/// assert_eq!(checks, vec![false, false, true, false, false, true]);
/// ```
#[derive(Debug)]
pub struct IntervalCheck {
  config: config::Shared,
  last_check: Stem<(Millis, u32)>,
}

impl IntervalCheck {
  /// Start counting from `now`
  pub fn new(config: config::Shared, now: Millis) -> Self {
    Self { config,
           last_check: Stem::new((now, 0)) }
  }
}

impl FreshnessCheck for IntervalCheck {
  fn check(&self, now: Millis) -> bool {
    let cfg = self.config.get().observe;
    self.last_check.map_mut(|(at, count)| {
                     *count += 1;
                     let due = now.0.saturating_sub(at.0) > cfg.check_interval.0
                               || *count >= cfg.check_interval_count;
                     if due {
                       *at = now;
                       *count = 0;
                     }
                     due
                   })
  }
}

#[derive(Debug, Default)]
pub(crate) struct State {
  pub(crate) established: bool,
  pub(crate) cancelled: bool,
  pub(crate) current: Option<Response>,
  pub(crate) next: Option<Response>,
}

struct Inner {
  source: Option<SocketAddr>,
  exchange: WeakExchange,
  endpoint: Option<ObservingEndpoint>,
  freshness: Box<dyn FreshnessCheck>,
  state: Stem<State>,
}

/// A peer's subscription to a resource, living on the exchange
/// of the request that registered it.
///
/// Cloning yields another handle to the same relation.
#[derive(Clone)]
pub struct ObserveRelation(Arc<Inner>);

impl ObserveRelation {
  /// Create an unestablished relation for `exchange`
  pub fn new<C>(exchange: &Exchange,
                source: Option<SocketAddr>,
                freshness: C,
                endpoint: Option<ObservingEndpoint>)
                -> Self
    where C: FreshnessCheck + 'static
  {
    Self(Arc::new(Inner { source,
                          exchange: exchange.downgrade(),
                          endpoint,
                          freshness: Box::new(freshness),
                          state: Stem::new(State::default()) }))
  }

  /// Create a relation for `exchange`, attach it to the exchange and establish it
  pub fn establish_on<C>(exchange: &Exchange,
                         source: Option<SocketAddr>,
                         freshness: C,
                         endpoint: Option<ObservingEndpoint>)
                         -> Self
    where C: FreshnessCheck + 'static
  {
    let rel = Self::new(exchange, source, freshness, endpoint);
    exchange.set_relation(rel.clone());
    rel.establish();
    rel
  }

  /// Address of the observer
  pub fn source(&self) -> Option<SocketAddr> {
    self.0.source
  }

  /// The exchange this relation lives on, if it is still alive
  pub fn exchange(&self) -> Option<Exchange> {
    self.0.exchange.upgrade()
  }

  /// Start sending notifications
  pub fn establish(&self) {
    let fresh = self.map_mut(|s| {
                      let fresh = !s.established && !s.cancelled;
                      s.established |= fresh;
                      fresh
                    });

    if fresh {
      if let Some(ep) = self.0.endpoint.as_ref() {
        ep.add(self.clone());
      }
    }
  }

  #[allow(missing_docs)]
  pub fn is_established(&self) -> bool {
    self.map_ref(|s| s.established)
  }

  #[allow(missing_docs)]
  pub fn is_cancelled(&self) -> bool {
    self.map_ref(|s| s.cancelled)
  }

  /// Should the next notification be CON?
  pub fn check(&self, now: Millis) -> bool {
    self.0.freshness.check(now)
  }

  /// The CON notification most recently sent
  pub fn current_notification(&self) -> Option<Response> {
    self.map_ref(|s| s.current.clone())
  }

  /// The notification waiting for [`ObserveRelation::current_notification`] to be acknowledged
  pub fn next_notification(&self) -> Option<Response> {
    self.map_ref(|s| s.next.clone())
  }

  /// Stop sending notifications and complete the exchange
  pub fn cancel(&self) {
    let cancelled = self.map_mut(|s| {
                          let first = !s.cancelled;
                          s.cancelled = true;
                          s.established = false;
                          s.next = None;
                          first
                        });

    if !cancelled {
      return;
    }

    log::debug!("cancelling observe relation with {:?}", self.source());
    if let Some(ep) = self.0.endpoint.as_ref() {
      ep.remove(self);
    }
    if let Some(ex) = self.exchange() {
      ex.complete();
    }
  }

  /// Cancel every relation of this relation's observer, or just this one
  /// when it does not belong to an [`ObservingEndpoint`]
  pub fn cancel_all(&self) {
    match self.0.endpoint.as_ref() {
      | Some(ep) => {
        ep.cancel_all();
        self.cancel();
      },
      | None => self.cancel(),
    }
  }

  /// Are `self` and `other` handles to the same relation?
  pub fn same(&self, other: &ObserveRelation) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  pub(crate) fn map_ref<F, R>(&self, f: F) -> R
    where F: for<'a> FnMut(&'a State) -> R
  {
    self.0.state.map_ref(f)
  }

  pub(crate) fn map_mut<F, R>(&self, f: F) -> R
    where F: for<'a> FnMut(&'a mut State) -> R
  {
    self.0.state.map_mut(f)
  }
}

impl core::fmt::Debug for ObserveRelation {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ObserveRelation")
     .field("source", &self.0.source)
     .field("freshness", &self.0.freshness)
     .field("state", &self.0.state)
     .finish()
  }
}

/// All observe relations of one peer
#[derive(Clone)]
pub struct ObservingEndpoint(Arc<(SocketAddr, Stem<Vec<ObserveRelation>>)>);

impl ObservingEndpoint {
  #[allow(missing_docs)]
  pub fn new(addr: SocketAddr) -> Self {
    Self(Arc::new((addr, Stem::new(Vec::new()))))
  }

  #[allow(missing_docs)]
  pub fn addr(&self) -> SocketAddr {
    self.0 .0
  }

  /// Established relations of this peer
  pub fn relations(&self) -> Vec<ObserveRelation> {
    self.0 .1.map_ref(|rs| rs.clone())
  }

  /// Cancel every relation of this peer
  pub fn cancel_all(&self) {
    let rels = self.0 .1.map_mut(|rs| core::mem::take(rs));
    rels.iter().for_each(ObserveRelation::cancel);
  }

  fn add(&self, rel: ObserveRelation) {
    let mut rel = Some(rel);
    self.0 .1.map_mut(|rs| rs.extend(rel.take()));
  }

  fn remove(&self, rel: &ObserveRelation) {
    self.0 .1.map_mut(|rs| rs.retain(|r| !r.same(rel)));
  }
}

impl core::fmt::Debug for ObservingEndpoint {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ObservingEndpoint")
     .field("addr", &self.addr())
     .field("relations", &self.0 .1.map_ref(|rs| rs.len()))
     .finish()
  }
}
