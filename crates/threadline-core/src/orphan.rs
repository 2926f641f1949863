use std::collections::HashSet;

use crate::message::{MessageDoc, Role};

/// Drops tool-role messages answering a call that is not in the list.
///
/// Pages cut at an arbitrary key can start with a tool result whose call sits
/// on the previous page; such results are removed. `messages` must be in
/// ascending `(order, stepOrder)` order.
pub fn filter_out_orphaned_tool_messages(messages: &[MessageDoc]) -> Vec<MessageDoc> {
    let mut seen_calls: HashSet<&str> = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    for message in messages {
        seen_calls.extend(message.tool_call_ids());
        if message.role == Role::Tool
            && !message
                .tool_result_ids()
                .all(|id| seen_calls.contains(id))
        {
            continue;
        }
        kept.push(message.clone());
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;
    use crate::message::{ContentPart, MessageKey, NewMessage};
    use serde_json::json;

    fn at(message: NewMessage, order: u64, step: u64) -> MessageDoc {
        message.into_doc(&ThreadId::new("t"), MessageKey::new(order, step))
    }

    fn call(id: &str) -> NewMessage {
        NewMessage::new(Role::Assistant, vec![ContentPart::tool_call(id, "f", json!({}))])
    }

    fn result(id: &str) -> NewMessage {
        NewMessage::new(Role::Tool, vec![ContentPart::tool_result(id, "f", json!(1))])
    }

    #[test]
    fn result_without_prior_call_is_dropped() {
        let messages = vec![
            at(result("c0"), 0, 2),
            at(NewMessage::user_text("q"), 1, 0),
            at(call("c1"), 1, 1),
            at(result("c1"), 1, 2),
        ];
        let kept = filter_out_orphaned_tool_messages(&messages);
        let keys: Vec<MessageKey> = kept.iter().map(MessageDoc::key).collect();
        assert_eq!(
            keys,
            vec![MessageKey::new(1, 0), MessageKey::new(1, 1), MessageKey::new(1, 2)]
        );
    }

    #[test]
    fn result_before_its_call_is_dropped() {
        let messages = vec![at(result("c1"), 0, 1), at(call("c1"), 0, 2)];
        let kept = filter_out_orphaned_tool_messages(&messages);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].role, Role::Assistant);
    }

    #[test]
    fn partially_matched_results_are_dropped() {
        let both = NewMessage::new(
            Role::Tool,
            vec![
                ContentPart::tool_result("c1", "f", json!(1)),
                ContentPart::tool_result("c2", "f", json!(2)),
            ],
        );
        let kept = filter_out_orphaned_tool_messages(&[at(call("c1"), 0, 0), at(both, 0, 1)]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn tool_message_without_results_is_kept() {
        let sources_only = at(NewMessage::new(Role::Tool, Vec::new()), 0, 0);
        let kept = filter_out_orphaned_tool_messages(&[sources_only.clone()]);
        assert_eq!(kept, vec![sources_only]);
    }
}
