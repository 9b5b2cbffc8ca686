use toad_msg::Code;

use crate::msg::Message;
use crate::req::Request;
use crate::time::Millis;

/// Response codes
pub mod code;

/// A CoAP response
///
/// ```
/// use toad_stack::req::Request;
/// use toad_stack::resp::{code, Response};
///
/// let mut req = Request::get("hello");
/// req.msg_mut().token = Some(toad_stack::msg::token_from_u32(7));
///
/// let resp = Response::for_request(&req, code::CONTENT);
/// assert_eq!(resp.msg().token, req.msg().token);
/// assert_eq!(resp.msg().ty, None);
/// assert!(resp.is_last());
/// ```
#[derive(Clone, Debug)]
pub struct Response {
  msg: Message,
  last: bool,
  rtt: Option<Millis>,
}

impl Response {
  /// Create a response with no type, ID or token
  pub fn new(code: Code) -> Self {
    Self { msg: Message::new(code),
           last: true,
           rtt: None }
  }

  /// Create a response to `req`, addressed to its source and carrying its token.
  ///
  /// The type is left for the stack to decide.
  pub fn for_request(req: &Request, code: Code) -> Self {
    let mut self_ = Self::new(code);
    self_.msg.token = req.msg().token;
    self_.msg.destination = req.msg().source;
    self_
  }

  #[allow(missing_docs)]
  pub fn code(&self) -> Code {
    self.msg.code
  }

  /// Replace the payload
  pub fn set_payload(&mut self, p: impl IntoIterator<Item = u8>) {
    self.msg.payload = p.into_iter().collect();
  }

  /// Is this the last response of its exchange?
  ///
  /// Notifications and intermediate blocks are not.
  pub fn is_last(&self) -> bool {
    self.last
  }

  #[allow(missing_docs)]
  pub fn set_last(&mut self, last: bool) {
    self.last = last;
  }

  /// Round-trip time of the whole transfer, set on reassembled responses
  pub fn rtt(&self) -> Option<Millis> {
    self.rtt
  }

  #[allow(missing_docs)]
  pub fn set_rtt(&mut self, rtt: Millis) {
    self.rtt = Some(rtt);
  }

  /// Obtain a reference to the inner message
  pub fn msg(&self) -> &Message {
    &self.msg
  }

  /// Obtain a mutable reference to the inner message
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.msg
  }
}

impl From<Message> for Response {
  fn from(msg: Message) -> Self {
    Self { msg,
           last: true,
           rtt: None }
  }
}

impl From<Response> for Message {
  fn from(resp: Response) -> Self {
    resp.msg
  }
}
