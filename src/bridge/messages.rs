//! Localized operational notices dispatched to channels.
//!
//! Timeout, abort, and link-failure notices are the only daemon-authored
//! text a channel ever sees; they are localized per channel before
//! dispatch using the configured channel locale.

/// Notice identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKey {
    /// The agent produced no reply within the turn timeout.
    TurnTimeout,
    /// The turn was aborted before completing.
    Aborted,
    /// The agent link failed while the request was in flight.
    LinkLost,
    /// A workspace switch failed while the message was buffered.
    SwitchFailed,
}

/// Render a notice in the given language tag (fallback: English).
#[must_use]
pub fn localize(lang: &str, key: NoticeKey) -> &'static str {
    match (lang, key) {
        ("zh", NoticeKey::TurnTimeout) => "请求超时，助手暂时没有回复。请稍后重试。",
        ("zh", NoticeKey::Aborted) => "本次请求已被中止。",
        ("zh", NoticeKey::LinkLost) => "与助手的连接中断，请求未能完成。",
        ("zh", NoticeKey::SwitchFailed) => "工作目录切换失败，消息未能送达助手。",
        (_, NoticeKey::TurnTimeout) => {
            "The assistant did not reply in time. Please try again later."
        }
        (_, NoticeKey::Aborted) => "This request was aborted.",
        (_, NoticeKey::LinkLost) => "The assistant link dropped before this request completed.",
        (_, NoticeKey::SwitchFailed) => {
            "The workspace switch failed; your message was not delivered."
        }
    }
}
