//! The render-surface collaborator boundary.
//!
//! The automation controller is the sole caller of this trait for the
//! lifetime of one automation session; nothing else drives the surface.

use anyhow::Result;

/// What the surface currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// Nothing rendered (white page, crashed tab).
    Blank,
    /// Navigation or paint in progress.
    Loading,
    /// Settled, non-blank render.
    Stable,
}

/// Pointer/keyboard input forwarded to the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceInput {
    Click { x: f64, y: f64 },
    Type { text: String },
    Scroll { dx: f64, dy: f64 },
}

/// A sandboxed browser-like target.
///
/// Implementations are expected to be honest about `render_state`:
/// blank-page recovery and the post-navigation settle both key off it.
pub trait RenderSurface: Send {
    /// Points the surface at a URL. Returns once navigation is issued,
    /// not once the page is stable; the controller polls for that.
    fn navigate(&mut self, url: &str) -> impl Future<Output = Result<()>> + Send;

    /// Reports the current render state.
    fn render_state(&mut self) -> impl Future<Output = Result<RenderState>> + Send;

    /// Captures the current render as encoded image bytes.
    fn capture(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Delivers one input gesture.
    fn dispatch_input(&mut self, input: &SurfaceInput) -> impl Future<Output = Result<()>> + Send;
}
