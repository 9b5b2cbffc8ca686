pub use toad_msg::Code;

use crate::code;

// 2.xx
code!(rfc7252("5.9.1.1") CREATED = 2*01);
code!(rfc7252("5.9.1.2") DELETED = 2*02);
code!(rfc7252("5.9.1.3") VALID   = 2*03);
code!(rfc7252("5.9.1.4") CHANGED = 2*04);
code!(rfc7252("5.9.1.5") CONTENT = 2*05);
code!(
      #[doc = concat!(
    "## [2.31 Continue](https://www.rfc-editor.org/rfc/rfc7959#section-2.9.1)\n",
    "This success status code indicates that the transfer of this\n",
    "block of the request body was successful and that the server\n",
    "encourages sending further blocks, but that a final outcome of the\n",
    "whole block-wise request cannot yet be determined.  No payload is\n",
    "returned with this response code.",
  )]
      CONTINUE = 2 * 31
);

// 4.xx
code!(rfc7252("5.9.2.1")  BAD_REQUEST              = 4*00);
code!(rfc7252("5.9.2.5")  NOT_FOUND                = 4*04);
code!(
      #[doc = concat!(
    "## [4.08 Request Entity Incomplete](https://www.rfc-editor.org/rfc/rfc7959#section-2.9.2)\n",
    "This client error status code indicates that the server has not\n",
    "received the blocks of the request body that it needs to proceed.\n",
    "The client has not sent all blocks, not sent them in the order\n",
    "required by the server, or has sent them long enough ago that the\n",
    "server has already discarded them.",
  )]
      REQUEST_ENTITY_INCOMPLETE = 4 * 08
);
code!(rfc7252("5.9.2.9")  REQUEST_ENTITY_TOO_LARGE = 4*13);

// 5.xx
code!(rfc7252("5.9.3.1") INTERNAL_SERVER_ERROR = 5*00);
code!(rfc7252("5.9.3.4") SERVICE_UNAVAILABLE   = 5*03);

/// Is this a 2.xx code?
pub fn is_success(code: Code) -> bool {
  code.class == 2
}

/// Render a code the way RFC7252 writes them, e.g. `2.05`
pub fn to_human(code: Code) -> String {
  format!("{}.{:02}", code.class, code.detail)
}
