use std::sync::Arc;

use embedded_time::duration::Milliseconds;

use super::{Error, Layer, Next};
use crate::config;
use crate::exchange::{Exchange, Origin, WeakExchange};
use crate::logging::msg_summary;
use crate::msg::{Code, EmptyMessage, Message, MessageObserver, Type};
use crate::relation::ObserveRelation;
use crate::req::Request;
use crate::resp::{code, Response};
use crate::time::{self, Scheduler};

/// Layer responsible for observe relations ([RFC7641](https://datatracker.ietf.org/doc/html/rfc7641)).
///
/// On the server side this decides whether a notification is CON or NON,
/// cancels relations on error notifications and RSTs, and makes sure at most
/// one CON notification per relation is in flight: a notification produced
/// while the previous CON is unacknowledged waits, and only the freshest one
/// is ever sent once the previous is acknowledged (or retransmitted).
///
/// On the client side it re-registers interest shortly after a notification's
/// Max-Age runs out, and rejects notifications for cancelled requests.
#[derive(Debug)]
pub struct Observe {
  config: config::Shared,
  scheduler: Arc<dyn Scheduler>,
}

impl Observe {
  /// Create the layer
  pub fn new(config: config::Shared, scheduler: Arc<dyn Scheduler>) -> Self {
    Self { config, scheduler }
  }

  fn prepare_reregistration(&self, next: &Next, exchange: &Exchange, notification: &Response) {
    let backoff = self.config.get().observe.reregistration_backoff;
    let delay = Milliseconds(u64::from(notification.msg().max_age()) * 1000 + backoff.0);

    let reregister = Reregister { next: next.clone(),
                                  exchange: exchange.downgrade() };
    let timer = self.scheduler
                    .after(delay, Box::new(move || reregister.fire()));
    log::trace!("re-registering in {:?}", delay);

    let mut slot = Some(timer);
    exchange.map_mut(|s| match slot.take() {
              | Some(t) if s.complete => {
                t.cancel();
              },
              | Some(t) => {
                time::cancel(&mut s.reregistration);
                s.reregistration = Some(t);
              },
              | None => (),
            });
  }
}

/// Is `resp` a CON still waiting for its ACK?
fn in_transit(resp: &Response) -> bool {
  let msg = resp.msg();
  msg.is_con() && !msg.is_acknowledged() && !msg.is_rejected() && !msg.is_timed_out()
}

/// Fires when a notification's Max-Age (plus backoff) ran out
#[derive(Debug)]
struct Reregister {
  next: Next,
  exchange: WeakExchange,
}

impl Reregister {
  fn fire(self) {
    let exchange = match self.exchange.upgrade() {
      | Some(ex) => ex,
      | None => return,
    };
    let original = match exchange.request() {
      | Some(req) => req,
      | None => return,
    };

    if original.msg().is_cancelled() {
      log::debug!("request was cancelled; not re-registering");
      return;
    }

    let mut refresh = Request::from(Message::new(Code::GET));
    let msg = refresh.msg_mut();
    msg.opts = original.msg().opts.clone();
    msg.set_observe(0);
    msg.token = original.msg().token;
    msg.destination = original.msg().destination;

    log::debug!("re-registering with {:?}", original.msg().destination);
    if let Err(e) = self.next
                        .this()
                        .send_request(&self.next, &exchange, refresh)
    {
      log::error!("re-registration failed: {}", e);
    }
  }
}

/// Watches a CON notification on behalf of its relation
#[derive(Debug)]
struct NotificationController {
  exchange: WeakExchange,
  relation: ObserveRelation,
  next: Next,
  scheduler: Arc<dyn Scheduler>,
}

impl NotificationController {
  /// Send `resp` from the top of the observe layer on a separate turn
  fn send(&self, exchange: Exchange, resp: Response) {
    let next = self.next.clone();
    self.scheduler.execute(Box::new(move || {
                                      if let Err(e) =
                                        next.this().send_response(&next, &exchange, resp)
                                      {
                                        log::error!("sending notification failed: {}", e);
                                      }
                                    }));
  }
}

impl MessageObserver for NotificationController {
  fn on_acknowledged(&self, _: &Message) {
    let exchange = match self.exchange.upgrade() {
      | Some(ex) => ex,
      | None => return,
    };

    let next = exchange.map_mut(|_| {
                         self.relation.map_mut(|r| {
                                        let next = r.next.take();
                                        if let Some(n) = next.as_ref() {
                                          r.current = Some(n.clone());
                                        }
                                        next
                                      })
                       });

    if let Some(mut next) = next {
      log::debug!("sending postponed {}", msg_summary(next.msg()));
      next.msg_mut().id = None;
      self.send(exchange, next);
    }
  }

  fn on_retransmitting(&self, msg: &Message) {
    let exchange = match self.exchange.upgrade() {
      | Some(ex) => ex,
      | None => return,
    };

    let next = exchange.map_mut(|_| {
                         self.relation.map_mut(|r| {
                                        let mut next = r.next.take()?;
                                        next.msg_mut().id = msg.id;
                                        next.msg_mut().ty = Some(Type::Con);
                                        r.current = Some(next.clone());
                                        Some(next)
                                      })
                       });

    if let Some(next) = next {
      log::debug!("fresher {} replaces the one being retransmitted",
                  msg_summary(next.msg()));
      msg.set_cancelled();
      self.send(exchange, next);
    }
  }

  fn on_timed_out(&self, _: &Message) {
    log::debug!("notification timed out; cancelling every relation of {:?}",
                self.relation.source());
    self.relation.cancel_all();
  }
}

impl Layer for Observe {
  fn send_response(&self,
                   next: &Next,
                   exchange: &Exchange,
                   mut resp: Response)
                   -> Result<(), Error> {
    let rel = match exchange.relation().filter(|r| r.is_established()) {
      | Some(rel) => rel,
      | None => return next.send_response(exchange, resp),
    };

    let request_settled = exchange.request()
                                  .map(|r| {
                                    r.msg().is_acknowledged() || r.msg().ty == Some(Type::Non)
                                  })
                                  .unwrap_or(false);

    if request_settled {
      if !code::is_success(resp.code()) {
        log::debug!("{} ends the relation", msg_summary(resp.msg()));
        resp.msg_mut().ty = Some(Type::Con);
        rel.cancel();
      } else if rel.check(self.scheduler.now()) {
        resp.msg_mut().ty = Some(Type::Con);
      } else if resp.msg().ty.is_none() {
        resp.msg_mut().ty = Some(Type::Non);
      }
    }

    resp.set_last(rel.is_cancelled());

    let postponed = exchange.map_mut(|_| {
                              rel.map_mut(|r| {
                                   let in_flight = r.current
                                                    .as_ref()
                                                    .filter(|cur| {
                                                      !cur.msg().same_instance(resp.msg())
                                                      && in_transit(cur)
                                                    })
                                                    .map(|cur| cur.msg().id);

                                   match in_flight {
                                     | Some(id) => {
                                       resp.msg_mut().id = id;
                                       r.next = Some(resp.clone());
                                       true
                                     },
                                     | None => {
                                       r.current = Some(resp.clone());
                                       r.next = None;
                                       false
                                     },
                                   }
                                 })
                            });

    if postponed {
      log::debug!("previous notification still in transit; postponing {}",
                  msg_summary(resp.msg()));
      return Ok(());
    }

    if resp.msg().is_con() {
      resp.msg()
          .set_observer(Arc::new(NotificationController { exchange: exchange.downgrade(),
                                                          relation: rel.clone(),
                                                          next: next.clone(),
                                                          scheduler: self.scheduler.clone() }));
    }

    next.send_response(exchange, resp)
  }

  fn receive_response(&self,
                      next: &Next,
                      exchange: &Exchange,
                      resp: Response)
                      -> Result<(), Error> {
    if resp.msg().has_observe() {
      let cancelled = exchange.request()
                              .map(|r| r.msg().is_cancelled())
                              .unwrap_or(false);
      if cancelled {
        log::debug!("rejecting notification for cancelled request");
        return next.send_empty_message(exchange, EmptyMessage::reset(resp.msg()));
      }

      self.prepare_reregistration(next, exchange, &resp);
    }

    next.receive_response(exchange, resp)
  }

  fn receive_empty_message(&self,
                           next: &Next,
                           exchange: &Exchange,
                           msg: EmptyMessage)
                           -> Result<(), Error> {
    if msg.ty() == Some(Type::Reset) && exchange.origin() == Origin::Remote {
      if let Some(rel) = exchange.relation() {
        log::debug!("RST from {:?} cancels its relation", rel.source());
        rel.cancel();
      }
    }

    next.receive_empty_message(exchange, msg)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::Config;
  use crate::msg::{known, Id, OptValue};
  use crate::relation::IntervalCheck;
  use crate::test::{self, Harness};

  fn harness() -> Harness {
    let mut config = Config::default();
    config.msg.use_random_id_start = false;
    Harness::full(config)
  }

  /// A server exchange with an established relation whose first
  /// response went out piggybacked
  fn observed(h: &Harness) -> (Exchange, ObserveRelation, Request) {
    let ex = h.exchange(Origin::Remote);
    let mut req = test::con_request(1, 7);
    req.msg_mut().set_observe(0);
    h.stack.receive_request(&ex, req.clone()).unwrap();

    let rel = ObserveRelation::establish_on(&ex,
                                            req.msg().source,
                                            IntervalCheck::new(h.config.clone(), h.now()),
                                            None);

    let mut first = Response::for_request(&req, code::CONTENT);
    first.msg_mut().set_observe(1);
    h.stack.send_response(&ex, first).unwrap();

    (ex, rel, req)
  }

  fn notification(req: &Request, n: u32, payload: &[u8]) -> Response {
    let mut resp = Response::for_request(req, code::CONTENT);
    resp.msg_mut().ty = Some(Type::Con);
    resp.msg_mut().set_observe(n);
    resp.set_payload(payload.iter().copied());
    resp
  }

  #[test]
  fn first_response_piggybacks_and_later_ones_are_non() {
    let h = harness();
    let (ex, rel, req) = observed(&h);

    let mut n = Response::for_request(&req, code::CONTENT);
    n.msg_mut().set_observe(2);
    h.stack.send_response(&ex, n).unwrap();

    let sent = h.outbox.responses();
    assert_eq!(sent[0].msg().ty, Some(Type::Ack));
    assert_eq!(sent[1].msg().ty, Some(Type::Non));
    assert!(!sent[1].is_last());
    assert!(rel.is_established());
    assert!(!ex.is_complete());
  }

  #[test]
  fn one_con_notification_in_flight() {
    let h = harness();
    let (ex, rel, req) = observed(&h);

    h.stack
     .send_response(&ex, notification(&req, 2, b"a"))
     .unwrap();
    let a = h.outbox.responses()[1].clone();
    assert_eq!(a.msg().ty, Some(Type::Con));

    h.stack
     .send_response(&ex, notification(&req, 3, b"b"))
     .unwrap();
    h.stack
     .send_response(&ex, notification(&req, 4, b"c"))
     .unwrap();
    assert_eq!(h.outbox.responses().len(), 2);
    assert_eq!(rel.next_notification().map(|n| n.msg().payload.clone()),
               Some(b"c".to_vec()));
    assert_eq!(rel.next_notification().and_then(|n| n.msg().id), a.msg().id);

    h.stack
     .receive_empty_message(&ex, EmptyMessage::ack(a.msg()))
     .unwrap();
    h.scheduler.run_pending();

    let sent = h.outbox.responses();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].msg().payload, b"c".to_vec());
    assert_eq!(sent[2].msg().ty, Some(Type::Con));
    assert_ne!(sent[2].msg().id, a.msg().id);
    assert!(rel.next_notification().is_none());
    assert!(rel.current_notification()
               .map(|c| c.msg().same_instance(sent[2].msg()))
               .unwrap_or(false));
  }

  #[test]
  fn fresher_notification_replaces_retransmission() {
    let h = harness();
    let (ex, rel, req) = observed(&h);

    h.stack
     .send_response(&ex, notification(&req, 2, b"a"))
     .unwrap();
    h.stack
     .send_response(&ex, notification(&req, 3, b"b"))
     .unwrap();
    let a = h.outbox.responses()[1].clone();

    h.advance(3_000);

    let sent = h.outbox.responses();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].msg().payload, b"b".to_vec());
    assert_eq!(sent[2].msg().id, a.msg().id);
    assert_eq!(sent[2].msg().ty, Some(Type::Con));
    assert!(a.msg().is_cancelled());
    assert!(rel.next_notification().is_none());
    assert!(ex.is_retransmitting());
  }

  #[test]
  fn exhausted_notification_cancels_relation() {
    let h = harness();
    let (ex, rel, req) = observed(&h);

    h.stack
     .send_response(&ex, notification(&req, 2, b"a"))
     .unwrap();
    h.advance(300_000);

    assert_eq!(h.outbox.responses().len(), 2 + 4);
    assert!(rel.is_cancelled());
    assert!(ex.is_complete());
    assert!(ex.is_timed_out());
  }

  #[test]
  fn error_notification_is_con_and_cancels() {
    let h = harness();
    let (ex, rel, req) = observed(&h);

    let err = Response::for_request(&req, code::NOT_FOUND);
    h.stack.send_response(&ex, err).unwrap();

    let sent = h.outbox.responses().last().cloned().unwrap();
    assert_eq!(sent.msg().ty, Some(Type::Con));
    assert!(sent.is_last());
    assert!(rel.is_cancelled());
    assert!(ex.is_complete());
  }

  #[test]
  fn reset_cancels_relation() {
    let h = harness();
    let (ex, rel, req) = observed(&h);

    h.stack
     .send_response(&ex, notification(&req, 2, b"a"))
     .unwrap();
    let a = h.outbox.responses()[1].clone();

    h.stack
     .receive_empty_message(&ex, EmptyMessage::reset(a.msg()))
     .unwrap();

    assert!(a.msg().is_rejected());
    assert!(rel.is_cancelled());
    assert!(ex.is_complete());

    rel.cancel();
    assert!(rel.is_cancelled());
  }

  fn client(h: &Harness) -> (Exchange, Request) {
    let ex = h.exchange(Origin::Local);
    let mut get = Request::get("temp");
    get.msg_mut().set_observe(0);
    get.msg_mut().destination = Some(test::addr());
    h.stack.send_request(&ex, get).unwrap();
    let sent = h.outbox.requests()[0].clone();
    (ex, sent)
  }

  fn incoming(req: &Request, n: u32) -> Response {
    let mut resp = Response::new(code::CONTENT);
    resp.msg_mut().ty = Some(Type::Non);
    resp.msg_mut().id = Some(Id(300 + n as u16));
    resp.msg_mut().token = req.msg().token;
    resp.msg_mut().set_observe(n);
    resp.msg_mut()
        .opts
        .set(known::MAX_AGE, OptValue(vec![1]));
    resp
  }

  #[test]
  fn client_reregisters_after_max_age() {
    let h = harness();
    let (ex, sent) = client(&h);

    h.stack.receive_response(&ex, incoming(&sent, 5)).unwrap();
    assert_eq!(h.deliverer.responses().len(), 1);
    assert!(!ex.is_complete());

    h.advance(2_999);
    assert_eq!(h.outbox.requests().len(), 1);

    h.advance(1);
    let requests = h.outbox.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].msg().observe(), Some(0));
    assert_eq!(requests[1].msg().token, sent.msg().token);
    assert_eq!(requests[1].msg().destination, Some(test::addr()));
  }

  #[test]
  fn newer_notification_pushes_reregistration_back() {
    let h = harness();
    let (ex, sent) = client(&h);

    h.stack.receive_response(&ex, incoming(&sent, 5)).unwrap();
    h.advance(2_000);
    h.stack.receive_response(&ex, incoming(&sent, 6)).unwrap();
    h.advance(2_000);
    assert_eq!(h.outbox.requests().len(), 1);

    h.advance(1_000);
    assert_eq!(h.outbox.requests().len(), 2);
  }

  #[test]
  fn cancelled_request_rejects_notifications() {
    let h = harness();
    let (ex, sent) = client(&h);

    ex.request().unwrap().msg().set_cancelled();
    h.stack.receive_response(&ex, incoming(&sent, 5)).unwrap();

    assert_eq!(h.outbox.empties()[0].ty(), Some(Type::Reset));
    assert!(h.deliverer.responses().is_empty());

    h.advance(10_000);
    assert_eq!(h.outbox.requests().len(), 1);
  }
}
