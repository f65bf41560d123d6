//! Shared UI icons.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static PAGE: Emoji<'_, '_> = Emoji("📄 ", "+");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
