// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exchange and queue naming conventions.
//!
//! Broker exchange names cannot carry Rust path separators, so every `::` or
//! `.` in a message type tag becomes `||`.

/// Separator used in every generated broker name.
pub const NAME_SEPARATOR: &str = "||";

pub fn exchange_name(type_tag: &str) -> String {
    type_tag
        .replace("::", NAME_SEPARATOR)
        .replace('.', NAME_SEPARATOR)
}

/// Queue used by queue configurations that do not name their queue.
pub fn default_request_queue(client_name: &str) -> String {
    format!("{client_name}{NAME_SEPARATOR}Requests")
}

/// Queue on which a client receives its RPC replies.
pub fn rpc_reply_queue(client_name: &str) -> String {
    format!("{client_name}{NAME_SEPARATOR}RpcResponse")
}

pub fn error_queue(client_name: &str) -> String {
    format!("{client_name}{NAME_SEPARATOR}Errors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_names_replace_path_separators() {
        assert_eq!(
            exchange_name("billing::events::InvoicePaid"),
            "billing||events||InvoicePaid"
        );
        assert_eq!(exchange_name("Billing.Events.Paid"), "Billing||Events||Paid");
    }

    #[test]
    fn per_client_queues_never_collide() {
        let a = [
            default_request_queue("a"),
            rpc_reply_queue("a"),
            error_queue("a"),
        ];
        let b = rpc_reply_queue("b");

        assert_eq!(a[1], "a||RpcResponse");
        assert!(!a.contains(&b));
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
    }
}
