use toad_msg::Code;

use crate::msg::{known, Message, OptValue};

/// Request methods
pub mod method;

#[doc(inline)]
pub use method::Method;

/// A CoAP request
///
/// ```
/// use toad_stack::req::{Method, Request};
///
/// let mut req = Request::get("sensors/temp");
/// req.msg_mut().set_observe(0);
///
/// assert_eq!(req.method(), Method::GET);
/// assert_eq!(req.msg().ty, None);
/// assert_eq!(req.msg().token, None);
/// ```
#[derive(Clone, Debug)]
pub struct Request(Message);

impl Request {
  /// Create a request with no type, ID or token; the stack assigns them on the way out.
  pub fn new(method: Method, path: impl AsRef<str>) -> Self {
    let mut self_ = Self(Message::new(method.code()));
    path.as_ref()
        .split('/')
        .filter(|s| !s.is_empty())
        .for_each(|seg| {
          self_.0
               .opts
               .add(known::URI_PATH, OptValue(seg.as_bytes().to_vec()))
        });
    self_
  }

  /// Create a new GET request
  pub fn get(path: impl AsRef<str>) -> Self {
    Self::new(Method::GET, path)
  }

  /// Create a new POST request
  pub fn post(path: impl AsRef<str>) -> Self {
    Self::new(Method::POST, path)
  }

  /// Create a new PUT request
  pub fn put(path: impl AsRef<str>) -> Self {
    Self::new(Method::PUT, path)
  }

  /// Create a new DELETE request
  pub fn delete(path: impl AsRef<str>) -> Self {
    Self::new(Method::DELETE, path)
  }

  /// Get the request method
  pub fn method(&self) -> Method {
    Method(self.0.code)
  }

  /// Replace the payload
  pub fn set_payload(&mut self, p: impl IntoIterator<Item = u8>) {
    self.0.payload = p.into_iter().collect();
  }

  /// Obtain a reference to the inner message
  pub fn msg(&self) -> &Message {
    &self.0
  }

  /// Obtain a mutable reference to the inner message
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.0
  }
}

impl From<Message> for Request {
  fn from(msg: Message) -> Self {
    Self(msg)
  }
}

impl From<Request> for Message {
  fn from(req: Request) -> Self {
    req.0
  }
}

impl From<Method> for Code {
  fn from(m: Method) -> Self {
    m.code()
  }
}
