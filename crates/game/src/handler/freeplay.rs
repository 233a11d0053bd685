use crate::session::PlayerId;

use super::{GameplayMessage, HandlerContext, SessionHandler, SnapshotError};

/// No-rules sandbox mode. Carries no state of its own; every scoped
/// value flows through the default rule set untouched.
#[derive(Default)]
pub struct FreeplayHandler;

impl FreeplayHandler {
    pub fn new() -> Self {
        Self
    }
}

impl SessionHandler for FreeplayHandler {
    fn tag(&self) -> &'static str {
        "freeplay"
    }

    fn start(&mut self, ctx: &HandlerContext) {
        log::debug!("freeplay handler live for session {}", ctx.multiverse);
    }

    fn stop(&mut self, _ctx: &HandlerContext) {}

    fn serialize_state(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(Vec::new())
    }

    fn restore_state(&mut self, _bytes: &[u8]) -> Result<(), SnapshotError> {
        Ok(())
    }

    fn handle_message(
        &mut self,
        ctx: &HandlerContext,
        sender: PlayerId,
        message: &GameplayMessage,
    ) {
        log::debug!(
            "freeplay session {} ignoring {message:?} from player {sender}",
            ctx.multiverse
        );
    }
}
