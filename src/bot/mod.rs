//! Chat bot (§11 supplemented feature). Out of scope per §1 as a
//! collaborator: the admin shell's `bot go|stop|say` subcommand and the
//! `AIM.use_aim` config gate are wired end to end against this trait, but
//! no AIM/OSCAR protocol client ships in this core — `NoopBot` is the only
//! implementation.

use tracing::info;

pub trait ChatBot: Send + Sync {
    fn go(&self);

    fn stop(&self);

    fn say(&self, user: &str, message: &str);
}

#[derive(Debug, Default)]
pub struct NoopBot;

impl ChatBot for NoopBot {
    fn go(&self) {
        info!("bot: go (noop — no chat backend configured)");
    }

    fn stop(&self) {
        info!("bot: stop (noop)");
    }

    fn say(&self, user: &str, message: &str) {
        info!(user, message, "bot: say (noop)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_bot_accepts_all_commands() {
        let bot = NoopBot;
        bot.go();
        bot.say("ace", "hello");
        bot.stop();
    }
}
