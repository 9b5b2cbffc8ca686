use toad_msg::Code;

/// Request method
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Method(pub(crate) Code);

impl Method {
  /// The message code of this method
  pub fn code(&self) -> Code {
    self.0
  }

  /// Does this method carry a request body that may be sent blockwise?
  pub fn has_body(&self) -> bool {
    *self == Self::POST || *self == Self::PUT
  }

  crate::code!(rfc7252("5.8.1") GET = Method(0*01));
  crate::code!(rfc7252("5.8.2") POST = Method(0*02));
  crate::code!(rfc7252("5.8.3") PUT = Method(0*03));
  crate::code!(rfc7252("5.8.4") DELETE = Method(0*04));
}

impl core::fmt::Display for Method {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let name = [(Self::GET, "GET"),
                (Self::POST, "POST"),
                (Self::PUT, "PUT"),
                (Self::DELETE, "DELETE")].into_iter()
                                         .find(|(m, _)| m == self)
                                         .map(|(_, n)| n);

    match name {
      | Some(n) => f.write_str(n),
      | None => write!(f, "{}.{:02}", self.0.class, self.0.detail),
    }
  }
}
