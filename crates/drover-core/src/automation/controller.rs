//! Throttled execution of computer actions against a render surface.

use tokio::time::{Duration, Instant, sleep, sleep_until};
use tracing::{debug, warn};

use super::surface::{RenderState, RenderSurface, SurfaceInput};
use super::watchdog::{BlankWatchdog, WatchdogVerdict};
use super::{ActionResult, AutomationError, AutomationSession, ComputerAction, Phase};

/// Minimum start-to-start gap between two actions in one session.
/// Prevents a rapid-fire action storm from desynchronizing the surface
/// from what the model last observed.
pub const MIN_ACTION_GAP: Duration = Duration::from_secs(2);

/// How long a continuously blank render is tolerated before the one
/// forced reload.
pub const BLANK_RECOVERY_BOUND: Duration = Duration::from_secs(5);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Executes one [`ComputerAction`] at a time against the surface it
/// exclusively owns.
///
/// Callers must have resolved any required approval before calling
/// [`execute`](AutomationController::execute); the controller enforces
/// throttling, the post-navigation settle, and blank-page recovery.
pub struct AutomationController<S> {
    surface: S,
}

impl<S: RenderSurface> AutomationController<S> {
    pub fn new(surface: S) -> Self {
        Self { surface }
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Runs one action to its terminal output.
    ///
    /// An early submission queues on the throttle gap rather than being
    /// dropped. Every call returns exactly one terminal result: success
    /// or an [`AutomationError`] (the session is failed on error).
    pub async fn execute(
        &mut self,
        action: &ComputerAction,
        session: &mut AutomationSession,
    ) -> Result<ActionResult, AutomationError> {
        if session.phase().is_terminal() {
            return Err(AutomationError::illegal_phase(session.phase(), Phase::Executing));
        }
        // From Completed a new action starts a fresh cycle.
        if session.phase() == Phase::Completed {
            session.advance(Phase::Idle)?;
        }

        if let Some(started) = session.last_action_started() {
            let due = started + MIN_ACTION_GAP;
            if Instant::now() < due {
                debug!(action = %action, "throttling action until the minimum gap expires");
            }
            sleep_until(due).await;
        }
        session.mark_action_started(Instant::now());
        session.advance(Phase::Executing)?;
        debug!(action = %action, "executing computer action");

        match self.run(action, session).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(action = %action, error = %err, "computer action failed");
                session.fail();
                Err(err)
            }
        }
    }

    async fn run(
        &mut self,
        action: &ComputerAction,
        session: &mut AutomationSession,
    ) -> Result<ActionResult, AutomationError> {
        match action {
            ComputerAction::Navigate { url } => {
                self.surface
                    .navigate(url)
                    .await
                    .map_err(|e| AutomationError::surface(format!("navigate failed: {e}")))?;
                session.set_last_url(url);
                session.advance(Phase::Settling)?;
                self.wait_for_stable(session).await?;
                session.advance(Phase::CaptureReady)?;
                session.advance(Phase::Completed)?;
                Ok(ActionResult::default())
            }
            ComputerAction::Click { x, y } => {
                self.dispatch(&SurfaceInput::Click { x: *x, y: *y }, session)
                    .await
            }
            ComputerAction::Type { text } => {
                self.dispatch(&SurfaceInput::Type { text: text.clone() }, session)
                    .await
            }
            ComputerAction::Scroll { dx, dy } => {
                self.dispatch(&SurfaceInput::Scroll { dx: *dx, dy: *dy }, session)
                    .await
            }
            ComputerAction::Wait { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                session.advance(Phase::Completed)?;
                Ok(ActionResult::default())
            }
            ComputerAction::Screenshot => {
                // A capture is only valid from a stable, non-blank
                // render; settle first.
                session.advance(Phase::Settling)?;
                self.wait_for_stable(session).await?;
                session.advance(Phase::CaptureReady)?;
                let bytes = self
                    .surface
                    .capture()
                    .await
                    .map_err(|e| AutomationError::surface(format!("capture failed: {e}")))?;
                session.advance(Phase::Completed)?;
                Ok(ActionResult {
                    capture: Some(bytes),
                })
            }
        }
    }

    async fn dispatch(
        &mut self,
        input: &SurfaceInput,
        session: &mut AutomationSession,
    ) -> Result<ActionResult, AutomationError> {
        self.surface
            .dispatch_input(input)
            .await
            .map_err(|e| AutomationError::surface(format!("input dispatch failed: {e}")))?;
        session.advance(Phase::Completed)?;
        Ok(ActionResult::default())
    }

    /// Polls the surface until it reports a stable render, reloading at
    /// most once if it stays blank past the bound.
    async fn wait_for_stable(
        &mut self,
        session: &mut AutomationSession,
    ) -> Result<(), AutomationError> {
        let mut watchdog = BlankWatchdog::new(BLANK_RECOVERY_BOUND);
        loop {
            let state = self
                .surface
                .render_state()
                .await
                .map_err(|e| AutomationError::surface(format!("render-state query failed: {e}")))?;

            match watchdog.observe(state, Instant::now()) {
                WatchdogVerdict::Healthy => {
                    if state == RenderState::Stable {
                        session.note_stable();
                        return Ok(());
                    }
                }
                WatchdogVerdict::ForceReload => {
                    session.note_blank();
                    let Some(url) = session.last_url().map(str::to_string) else {
                        return Err(AutomationError::blank_page(
                            "surface is blank and there is no URL to reload",
                        ));
                    };
                    warn!(url = %url, "surface blank past the bound, forcing one reload");
                    self.surface
                        .navigate(&url)
                        .await
                        .map_err(|e| AutomationError::surface(format!("reload failed: {e}")))?;
                }
                WatchdogVerdict::Fatal => {
                    session.note_blank();
                    return Err(AutomationError::blank_page(
                        "surface still blank after forced reload",
                    ));
                }
            }

            sleep(SETTLE_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::Result;

    use super::*;
    use crate::automation::AutomationErrorKind;

    /// Scripted surface: pops one render state per query, repeating the
    /// last one when the script runs out, and records navigations.
    struct MockSurface {
        states: VecDeque<RenderState>,
        last_state: RenderState,
        navigations: Vec<String>,
        inputs: Vec<SurfaceInput>,
        capture_bytes: Vec<u8>,
    }

    impl MockSurface {
        fn with_states(states: Vec<RenderState>) -> Self {
            Self {
                states: states.into(),
                last_state: RenderState::Stable,
                navigations: Vec::new(),
                inputs: Vec::new(),
                capture_bytes: b"png".to_vec(),
            }
        }

        fn stable() -> Self {
            Self::with_states(vec![RenderState::Stable])
        }

        fn always_blank() -> Self {
            let mut surface = Self::with_states(vec![RenderState::Blank]);
            surface.last_state = RenderState::Blank;
            surface
        }
    }

    impl RenderSurface for MockSurface {
        async fn navigate(&mut self, url: &str) -> Result<()> {
            self.navigations.push(url.to_string());
            Ok(())
        }

        async fn render_state(&mut self) -> Result<RenderState> {
            if let Some(state) = self.states.pop_front() {
                self.last_state = state;
            }
            Ok(self.last_state)
        }

        async fn capture(&mut self) -> Result<Vec<u8>> {
            Ok(self.capture_bytes.clone())
        }

        async fn dispatch_input(&mut self, input: &SurfaceInput) -> Result<()> {
            self.inputs.push(input.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_action_start_respects_the_minimum_gap() {
        let mut controller = AutomationController::new(MockSurface::stable());
        let mut session = AutomationSession::new();
        let t0 = Instant::now();

        controller
            .execute(&ComputerAction::Wait { ms: 0 }, &mut session)
            .await
            .unwrap();
        let first_start = session.last_action_started().unwrap();

        controller
            .execute(&ComputerAction::Wait { ms: 0 }, &mut session)
            .await
            .unwrap();
        let second_start = session.last_action_started().unwrap();

        assert!(first_start.duration_since(t0) < MIN_ACTION_GAP);
        assert!(second_start.duration_since(first_start) >= MIN_ACTION_GAP);
    }

    #[tokio::test(start_paused = true)]
    async fn action_after_the_gap_runs_without_queuing() {
        let mut controller = AutomationController::new(MockSurface::stable());
        let mut session = AutomationSession::new();

        controller
            .execute(&ComputerAction::Wait { ms: 0 }, &mut session)
            .await
            .unwrap();
        sleep(MIN_ACTION_GAP + Duration::from_secs(1)).await;

        let before = Instant::now();
        controller
            .execute(&ComputerAction::Wait { ms: 0 }, &mut session)
            .await
            .unwrap();
        assert_eq!(session.last_action_started().unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn navigate_settles_before_completing() {
        let mut controller = AutomationController::new(MockSurface::with_states(vec![
            RenderState::Loading,
            RenderState::Loading,
            RenderState::Stable,
        ]));
        let mut session = AutomationSession::new();

        controller
            .execute(
                &ComputerAction::Navigate {
                    url: "https://example.test".to_string(),
                },
                &mut session,
            )
            .await
            .unwrap();

        assert_eq!(session.phase(), Phase::Completed);
        assert_eq!(session.last_url(), Some("https://example.test"));
        assert_eq!(controller.surface_mut().navigations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_blank_reloads_once_then_fails() {
        let mut controller = AutomationController::new(MockSurface::always_blank());
        let mut session = AutomationSession::new();

        let err = controller
            .execute(
                &ComputerAction::Navigate {
                    url: "https://broken.test".to_string(),
                },
                &mut session,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), AutomationErrorKind::BlankPage);
        assert_eq!(session.phase(), Phase::Failed);
        // Initial navigation plus exactly one forced reload.
        assert_eq!(
            controller.surface_mut().navigations,
            vec![
                "https://broken.test".to_string(),
                "https://broken.test".to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blank_that_recovers_after_reload_succeeds() {
        // Blank past the bound, reload, then the page comes up.
        let mut states = vec![RenderState::Blank; 30];
        states.push(RenderState::Stable);
        let mut surface = MockSurface::with_states(states);
        surface.last_state = RenderState::Blank;
        let mut controller = AutomationController::new(surface);
        let mut session = AutomationSession::new();

        controller
            .execute(
                &ComputerAction::Navigate {
                    url: "https://slow.test".to_string(),
                },
                &mut session,
            )
            .await
            .unwrap();

        assert_eq!(session.phase(), Phase::Completed);
        assert_eq!(controller.surface_mut().navigations.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn screenshot_captures_after_settle() {
        let mut controller = AutomationController::new(MockSurface::stable());
        let mut session = AutomationSession::new();

        let result = controller
            .execute(&ComputerAction::Screenshot, &mut session)
            .await
            .unwrap();

        assert_eq!(result.capture.as_deref(), Some(b"png".as_slice()));
        assert_eq!(session.phase(), Phase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn input_actions_reach_the_surface() {
        let mut controller = AutomationController::new(MockSurface::stable());
        let mut session = AutomationSession::new();

        controller
            .execute(&ComputerAction::Click { x: 10.0, y: 20.0 }, &mut session)
            .await
            .unwrap();
        controller
            .execute(
                &ComputerAction::Type {
                    text: "hello".to_string(),
                },
                &mut session,
            )
            .await
            .unwrap();

        let inputs = &controller.surface_mut().inputs;
        assert_eq!(inputs.len(), 2);
        assert!(matches!(inputs[0], SurfaceInput::Click { .. }));
        assert!(matches!(
            &inputs[1],
            SurfaceInput::Type { text } if text == "hello"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_rejects_further_actions() {
        let mut controller = AutomationController::new(MockSurface::always_blank());
        let mut session = AutomationSession::new();

        controller
            .execute(
                &ComputerAction::Navigate {
                    url: "https://broken.test".to_string(),
                },
                &mut session,
            )
            .await
            .unwrap_err();

        let err = controller
            .execute(&ComputerAction::Screenshot, &mut session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AutomationErrorKind::IllegalPhase);
    }
}
