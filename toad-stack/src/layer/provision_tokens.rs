use core::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

use super::{Error, Layer, Next};
use crate::config;
use crate::exchange::Exchange;
use crate::msg::{self, Token};
use crate::req::Request;
use crate::resp::Response;
use crate::time::Millis;

/// Layer responsible for giving every outbound request a token unique
/// among the requests sent by this stack, and every outbound response
/// the token of the request it answers.
///
/// Tokens are a 4-byte big-endian counter, starting at a random value
/// when [`use_random_token_start`](config::Msg::use_random_token_start) is set.
///
/// Inbound requests and responses must already carry a token; an empty
/// token is fine, a missing one is an [`Error::MissingToken`].
#[derive(Debug)]
pub struct ProvisionTokens {
  counter: AtomicU32,
}

impl ProvisionTokens {
  /// Create the layer, seeding the counter from `config`
  pub fn new(config: &config::Shared, now: Millis) -> Self {
    let cfg = config.get().msg;
    let start = if cfg.use_random_token_start {
      crate::time::rng(cfg.token_seed, now).gen()
    } else {
      0
    };

    Self { counter: AtomicU32::new(start) }
  }

  /// The next token
  pub fn next_token(&self) -> Token {
    msg::token_from_u32(self.counter.fetch_add(1, Ordering::Relaxed))
  }
}

impl Layer for ProvisionTokens {
  fn send_request(&self, next: &Next, exchange: &Exchange, mut req: Request) -> Result<(), Error> {
    if req.msg().token.is_none() {
      let token = self.next_token();
      log::trace!("assigning token {:?} to {}",
                  token,
                  crate::logging::msg_summary(req.msg()));
      req.msg_mut().token = Some(token);
    }

    next.send_request(exchange, req)
  }

  fn send_response(&self,
                   next: &Next,
                   exchange: &Exchange,
                   mut resp: Response)
                   -> Result<(), Error> {
    if resp.msg().token.is_none() {
      resp.msg_mut().token = exchange.current_request().and_then(|r| r.msg().token);
    }

    next.send_response(exchange, resp)
  }

  fn receive_request(&self, next: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    if req.msg().token.is_none() {
      log::error!("received request without a token: {:?}", req.msg());
      return Err(Error::MissingToken);
    }

    next.receive_request(exchange, req)
  }

  fn receive_response(&self,
                      next: &Next,
                      exchange: &Exchange,
                      resp: Response)
                      -> Result<(), Error> {
    if resp.msg().token.is_none() {
      log::error!("received response without a token: {:?}", resp.msg());
      return Err(Error::MissingToken);
    }

    next.receive_response(exchange, resp)
  }
}
