use std::collections::BTreeMap;

use serde_json::Value;

use super::node::Condition;

/// A directed edge to another node of the same graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Target node id.
    pub next_id: String,
    pub title: Option<String>,
    /// Absent means unconditional (the default branch at an exclusive gateway).
    pub condition: Option<Condition>,
    /// Higher priorities are evaluated first.
    pub priority: i32,
    pub meta: BTreeMap<String, Value>,
}

impl Link {
    /// Create an unconditional link.
    pub fn to(next_id: impl Into<String>) -> Self {
        Self {
            next_id: next_id.into(),
            title: None,
            condition: None,
            priority: 0,
            meta: BTreeMap::new(),
        }
    }

    /// Create a conditional link.
    pub fn when(next_id: impl Into<String>, condition: &str) -> Self {
        Self {
            condition: Condition::parse(condition),
            ..Self::to(next_id)
        }
    }

    pub fn is_default(&self) -> bool {
        self.condition.is_none()
    }
}

/// Order links for evaluation: priority descending, ties in declaration order.
pub(crate) fn sort_links(links: &mut [Link]) {
    // sort_by is stable
    links.sort_by(|a, b| b.priority.cmp(&a.priority));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_builders() {
        let l = Link::to("b");
        assert_eq!(l.next_id, "b");
        assert!(l.is_default());

        let l = Link::when("c", "score >= 60");
        assert!(matches!(l.condition, Some(Condition::Inline(ref c)) if c == "score >= 60"));

        let l = Link::when("d", "  ");
        assert!(l.is_default());
    }

    #[test]
    fn test_sort_links_keeps_declaration_order_on_ties() {
        let mut links = vec![
            Link::to("a"),
            Link {
                priority: 5,
                ..Link::to("b")
            },
            Link::to("c"),
            Link {
                priority: 5,
                ..Link::to("d")
            },
        ];
        sort_links(&mut links);
        let order: Vec<&str> = links.iter().map(|l| l.next_id.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }
}
