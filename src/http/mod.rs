//! Request-head parsing.
//!
//! Only as much HTTP/1.x as routing needs: the request line and header
//! lines, scanned incrementally as bytes arrive.
//!
//! - **`parser`**: resumable scanner producing a [`request::RequestHead`]
//! - **`request`**: the extracted method, target, version and headers
//!
//! # Example
//!
//! ```
//! use conduit::http::parser::{ParseOutcome, ParserContext};
//!
//! let mut parser = ParserContext::new();
//! assert_eq!(parser.feed(b"GET /foo HT").unwrap(), ParseOutcome::NeedMoreData);
//! match parser.feed(b"TP/1.1\r\nHost: x\r\n\r\n").unwrap() {
//!     ParseOutcome::Ready { head, remainder } => {
//!         assert_eq!(head.target, "/foo");
//!         assert_eq!(head.header("Host"), Some("x"));
//!         assert_eq!(remainder, 2);
//!     }
//!     ParseOutcome::NeedMoreData => unreachable!(),
//! }
//! ```

pub mod parser;
pub mod request;
