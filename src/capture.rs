use anyhow::{Context, Result};
use log::{info, warn};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time;

use crate::tab::Tab;

// Page conventions observed by the section driver. The captured page marks
// a section with the `revealed` class once its entrance animation starts,
// and flips `data-typing` to `done` when a typing effect finishes.
const REVEAL_CLASS: &str = "revealed";
const TYPING_ATTR: &str = "data-typing";

const SCROLL_SETTLE: Duration = Duration::from_millis(700);
const HERO_HOLD: Duration = Duration::from_millis(3000);
const SECTION_PAUSE: Duration = Duration::from_millis(500);
const REVEAL_BUDGET: Duration = Duration::from_millis(5000);
const TYPING_BUDGET: Duration = Duration::from_millis(8000);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const SCROLL_DURATION: Duration = Duration::from_secs(12);
const SCROLL_STEPS: u32 = 120;

const FRAME_COUNT: u32 = 80;
const FRAME_SETTLE: Duration = Duration::from_millis(80);

/// Linear scroll interpolation: offset for `step` of `total_steps` across a
/// `max` scrollable distance, clamped to `[0, max]`.
pub(crate) fn scroll_offset(step: u32, total_steps: u32, max: f64) -> f64 {
    if total_steps == 0 {
        return 0.0;
    }
    (step as f64 / total_steps as f64 * max).clamp(0.0, max.max(0.0))
}

/// File name for the frame at ordinal `index`.
///
/// Zero-padded to three digits so a lexical directory listing reproduces
/// capture order for any count below 1000; the encoder consumes the
/// matching `frame_%03d.png` pattern.
pub(crate) fn frame_filename(index: u32) -> String {
    format!("frame_{index:03}.png")
}

/// Repeatedly evaluates `probe` until it returns true or `budget` elapses.
///
/// Returns `Ok(false)` on a soft timeout rather than erroring: callers
/// decide whether an unmet condition is a problem. Probe errors propagate.
pub(crate) async fn poll_until<F, Fut>(
    mut probe: F,
    budget: Duration,
    interval: Duration,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if probe().await? {
            return Ok(true);
        }
        if start.elapsed() >= budget {
            return Ok(false);
        }
        time::sleep(interval).await;
    }
}

/// Section-aware driver: walk the page's `<section>` elements in document
/// order, waiting for each one's reveal and typing markers before moving on.
/// The first section is the hero and is simply held on screen.
///
/// Policy: wait for observable completion, but always make forward
/// progress. No section can stall the run past its polling budget.
pub(crate) async fn run_section_driver(tab: &Tab) -> Result<()> {
    let count = tab
        .evaluate_f64("document.querySelectorAll('section').length")
        .await? as u32;
    info!("Section capture: {count} sections");

    for i in 0..count {
        tab.evaluate(&format!(
            "document.querySelectorAll('section')[{i}]\
             ?.scrollIntoView({{ behavior: 'smooth', block: 'center' }})"
        ))
        .await?;
        time::sleep(SCROLL_SETTLE).await;

        if i == 0 {
            info!("Holding hero section");
            time::sleep(HERO_HOLD).await;
            time::sleep(SECTION_PAUSE).await;
            continue;
        }

        let revealed_expr = format!(
            "document.querySelectorAll('section')[{i}]\
             ?.classList.contains('{REVEAL_CLASS}') === true"
        );
        let revealed = poll_until(
            || tab.evaluate_bool(&revealed_expr),
            REVEAL_BUDGET,
            POLL_INTERVAL,
        )
        .await?;

        if !revealed {
            // The page's own observer never fired. If the section is on
            // screen anyway, synthesize the marker and carry on.
            let forced = tab
                .evaluate_bool(&format!(
                    "(() => {{ \
                       const el = document.querySelectorAll('section')[{i}]; \
                       if (!el) return false; \
                       const r = el.getBoundingClientRect(); \
                       const visible = r.top < window.innerHeight && r.bottom > 0; \
                       if (visible) el.classList.add('{REVEAL_CLASS}'); \
                       return visible; \
                     }})()"
                ))
                .await?;
            warn!("Section {i} never revealed itself (forced marker: {forced})");
        }

        let typed_expr = format!(
            "Array.from(document.querySelectorAll('section')[{i}]\
             ?.querySelectorAll('[{TYPING_ATTR}]') ?? [])\
             .every(el => el.getAttribute('{TYPING_ATTR}') === 'done')"
        );
        let typed = poll_until(|| tab.evaluate_bool(&typed_expr), TYPING_BUDGET, POLL_INTERVAL)
            .await?;
        if !typed {
            warn!("Section {i}: typing effects did not finish within budget, moving on");
        }

        info!("Section {}/{} captured", i + 1, count);
        time::sleep(SECTION_PAUSE).await;
    }

    Ok(())
}

/// Continuous-scroll driver: one smooth top-to-bottom sweep across a fixed
/// duration in equal time steps, while the screencast recorder runs.
pub(crate) async fn run_scroll_driver(tab: &Tab) -> Result<()> {
    let max = tab.max_scroll().await?;
    let step_interval = SCROLL_DURATION / SCROLL_STEPS;
    info!("Scroll capture: {max:.0}px over {SCROLL_STEPS} steps");

    for i in 1..=SCROLL_STEPS {
        let y = scroll_offset(i, SCROLL_STEPS, max);
        tab.scroll_to(y, true).await?;
        time::sleep(step_interval).await;
        if i % 20 == 0 {
            info!("Scroll progress: {}%", i * 100 / SCROLL_STEPS);
        }
    }

    Ok(())
}

/// Discrete-frame driver: jump through interpolated offsets and screenshot
/// the viewport at each, producing a lexically ordered frame sequence.
///
/// The caller registers the frames directory for cleanup before this runs,
/// so frames written ahead of a mid-capture failure are still swept.
pub(crate) async fn run_frames_driver(tab: &Tab, frames_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(frames_dir)
        .with_context(|| format!("Failed to create {}", frames_dir.display()))?;

    let max = tab.max_scroll().await?;
    info!("Frame capture: {FRAME_COUNT} frames across {max:.0}px");

    for i in 0..FRAME_COUNT {
        let y = scroll_offset(i, FRAME_COUNT - 1, max);
        tab.scroll_to(y, false).await?;
        time::sleep(FRAME_SETTLE).await;

        let png = tab.screenshot_viewport().await?;
        let path = frames_dir.join(frame_filename(i));
        std::fs::write(&path, png)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        if (i + 1) % 20 == 0 {
            info!("Captured {}/{FRAME_COUNT} frames", i + 1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_offset_hits_both_endpoints() {
        assert_eq!(scroll_offset(0, 100, 4200.0), 0.0);
        assert_eq!(scroll_offset(100, 100, 4200.0), 4200.0);
    }

    #[test]
    fn scroll_offset_is_clamped_and_monotone() {
        let max = 1000.0;
        assert_eq!(scroll_offset(150, 100, max), max);
        let mut prev = -1.0;
        for i in 0..=100 {
            let y = scroll_offset(i, 100, max);
            assert!(y >= prev && y <= max);
            prev = y;
        }
    }

    #[test]
    fn scroll_offset_handles_degenerate_inputs() {
        assert_eq!(scroll_offset(5, 0, 1000.0), 0.0);
        assert_eq!(scroll_offset(5, 10, 0.0), 0.0);
    }

    #[test]
    fn frame_filenames_sort_lexically_in_capture_order() {
        let names: Vec<String> = (0..FRAME_COUNT).map(frame_filename).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn frame_padding_avoids_collisions_up_to_a_thousand() {
        assert_eq!(frame_filename(0), "frame_000.png");
        assert_eq!(frame_filename(7), "frame_007.png");
        assert_eq!(frame_filename(999), "frame_999.png");
        assert!(frame_filename(99) < frame_filename(100));
    }

    #[tokio::test]
    async fn poll_until_returns_within_budget_when_condition_never_holds() {
        let budget = Duration::from_millis(100);
        let start = Instant::now();
        let hit = poll_until(|| async { Ok(false) }, budget, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!hit);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn poll_until_stops_at_first_success() {
        let mut calls = 0;
        let hit = poll_until(
            || {
                calls += 1;
                let done = calls >= 3;
                async move { Ok(done) }
            },
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert!(hit);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn poll_until_propagates_probe_errors() {
        let res = poll_until(
            || async { anyhow::bail!("probe broke") },
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert!(res.is_err());
    }
}
