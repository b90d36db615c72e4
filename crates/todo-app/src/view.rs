//! 端末向けの一覧描画

use crate::list_store::ListSnapshot;
use domain::UserIdentity;
use std::fmt::Write;

pub const EMPTY_MESSAGE: &str = "No todos yet. Add your first one above!";
pub const LOADING_MESSAGE: &str = "Loading todos...";

/// 一覧を行番号付きのテキストにする。番号は 1 始まりで REPL のコマンドと対応する
pub fn render(snapshot: &ListSnapshot, user: Option<&UserIdentity>) -> String {
    let mut out = String::new();

    if let Some(user) = user {
        let _ = writeln!(out, "== Todos ({}) ==", user.display_name());
    }
    if let Some(message) = snapshot.error_message() {
        let _ = writeln!(out, "! {message}");
    }

    if snapshot.loading && snapshot.is_empty() {
        let _ = writeln!(out, "{LOADING_MESSAGE}");
        return out;
    }
    if snapshot.is_empty() {
        let _ = writeln!(out, "{EMPTY_MESSAGE}");
        return out;
    }

    for (index, item) in snapshot.items.iter().enumerate() {
        let mark = if item.completed { "x" } else { " " };
        let pending = if item.id.is_temporary() { " (saving)" } else { "" };
        let _ = writeln!(out, "{:>3}. [{mark}] {}{pending}", index + 1, item.content);
    }
    out
}
