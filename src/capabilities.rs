//! Effect boundary between the core and its shells.
//!
//! Everything that touches the outside world goes through these capabilities;
//! the core itself never performs IO, draws, or reads input directly.

pub use crux_core::render::Render;
pub use crux_http::Http;

use crate::app::App;
use crate::Event;

pub type AppHttp = Http<Event>;
pub type AppRender = Render<Event>;

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    /// Ask the shell to redraw from the current view model.
    pub render: Render<Event>,
    /// Outbound HTTP, used only for the default-image bootstrap fetch.
    pub http: Http<Event>,
}
