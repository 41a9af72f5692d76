//! # omnigate-template
//!
//! Renderer for the template strings embedded in tool definitions:
//! endpoints, headers, request bodies and response shapes. The syntax is
//! the `{{...}}` action form used by the gateway's config format:
//!
//! ```text
//! {{.Config.url}}/p/{{.Args.id}}
//! {{add .Args.n 1}}
//! {{.Args.tags | toJSON}}
//! {{safeGetOr "user.name" .Response.Data "anonymous"}}
//! ```
//!
//! Rendering is pure except for `env`: no filesystem access, no network,
//! no eval. A missing context key renders as the empty string; `safeGet`
//! on a missing path yields null rather than an error. Parse errors are
//! fatal for the owning tool and surface at config-validation time;
//! runtime failures produce a [`RenderError`] naming the failing step.

mod context;
mod error;
mod parse;
mod render;

pub use context::{RenderContext, RequestContext, ResponseContext};
pub use error::{ParseError, RenderError};
pub use parse::Template;
pub use render::to_json_string;
