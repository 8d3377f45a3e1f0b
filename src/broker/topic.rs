//! Bindings and routing-key matching.
//!
//! An exchange keeps a list of `Binding`s; a published routing key is routed
//! to every bound queue whose binding key matches under the exchange's rule.
//! Duplicate bindings are a no-op.

use crate::broker::ExchangeKind;

pub type QueueName = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: QueueName,
    pub binding_key: String,
}

/// The bindings of one exchange.
#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bindings: Vec::new(),
        }
    }

    /// Add a binding. Binding the same queue and key twice is ignored.
    pub fn bind(&mut self, queue: &str, binding_key: &str) {
        let binding = Binding {
            queue: queue.to_string(),
            binding_key: binding_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Drop every binding that targets `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Queues that should receive a message published with `routing_key`,
    /// each listed once, in binding order.
    pub fn route(&self, routing_key: &str) -> Vec<QueueName> {
        let mut targets: Vec<QueueName> = Vec::new();
        for binding in &self.bindings {
            if matches(self.kind, &binding.binding_key, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

/// Does `routing_key` match `binding_key` under `kind`?
///
/// Topic keys are dot-separated words: `*` stands for exactly one word and
/// `#` for zero or more words.
pub fn matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && topic_matches(rest, &words[1..])
        }
    }
}
