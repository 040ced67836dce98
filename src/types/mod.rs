//! Canonical request/response data model shared by every provider adapter.

pub mod message;
pub mod request;
pub mod response;
pub mod tool;

pub use message::{CacheType, FunctionCall, Message, Role, ToolCall};
pub use request::{Request, RequestBuilder};
pub use response::{Content, Response, Usage};
pub use tool::{FunctionSpec, Tool};
