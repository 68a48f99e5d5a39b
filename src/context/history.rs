use crate::models::ChatMessage;

pub const HISTORY_TRUNCATION_MARKER: &str = "\n\n[... message truncated ...]";

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySelection {
    /// Chronological order.
    pub messages: Vec<ChatMessage>,
    pub used_chars: usize,
    pub truncated: bool,
}

/// Keep the newest contiguous run of whole messages that fits `budget`.
///
/// The most recent message is never dropped: if it alone is too large it is
/// cut to a prefix plus [`HISTORY_TRUNCATION_MARKER`].
pub fn select_history(messages: &[ChatMessage], budget: usize) -> HistorySelection {
    let total: usize = messages.iter().map(ChatMessage::size).sum();
    if total <= budget {
        return HistorySelection {
            messages: messages.to_vec(),
            used_chars: total,
            truncated: false,
        };
    }

    let Some((latest, older)) = messages.split_last() else {
        return HistorySelection {
            messages: vec![],
            used_chars: 0,
            truncated: false,
        };
    };

    if latest.size() > budget {
        let cut = truncate_message(latest, budget);
        let used_chars = cut.size();
        return HistorySelection {
            messages: vec![cut],
            used_chars,
            truncated: true,
        };
    }

    let mut kept = vec![latest.clone()];
    let mut used = latest.size();
    for msg in older.iter().rev() {
        let size = msg.size();
        if used + size > budget {
            break;
        }
        used += size;
        kept.push(msg.clone());
    }
    kept.reverse();

    HistorySelection {
        messages: kept,
        used_chars: used,
        truncated: true,
    }
}

fn truncate_message(msg: &ChatMessage, budget: usize) -> ChatMessage {
    let role_len = msg.role.as_str().chars().count();
    let marker_len = HISTORY_TRUNCATION_MARKER.chars().count();
    let content = match budget.checked_sub(role_len + marker_len) {
        Some(room) => {
            let mut prefix: String = msg.content.chars().take(room).collect();
            prefix.push_str(HISTORY_TRUNCATION_MARKER);
            prefix
        }
        None => msg
            .content
            .chars()
            .take(budget.saturating_sub(role_len))
            .collect(),
    };
    ChatMessage::new(msg.role, content)
}
