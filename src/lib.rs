/*!
Capture a scrolling web page with headless Chrome and assemble a looping
GIF preview with ffmpeg.

The pipeline is strictly sequential: launch an isolated browser, wait for
the target page to settle, drive one of three capture strategies
(section-aware, continuous scroll, or discrete frames), then run ffmpeg's
two-pass palette encode and delete every intermediate artifact. Only the
final GIF survives a run.
*/

mod browser;
mod capture;
mod encode;
mod pipeline;
mod recorder;
mod tab;
mod transport;
mod types;

pub use browser::Browser;
pub use pipeline::run;
pub use tab::Tab;
pub use types::{CaptureStrategy, DEFAULT_URL, PipelineConfig, Viewport};
