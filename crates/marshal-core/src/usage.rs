use serde::{Deserialize, Serialize};

/// Accumulated token counters for one tracked session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_both_directions() {
        let u = TokenUsage { input_tokens: 100, output_tokens: 40 };
        assert_eq!(u.total(), 140);
    }

    #[test]
    fn add_accumulates() {
        let mut u = TokenUsage { input_tokens: 10, output_tokens: 5 };
        u.add(&TokenUsage { input_tokens: 1, output_tokens: 2 });
        assert_eq!(u.input_tokens, 11);
        assert_eq!(u.output_tokens, 7);
    }
}
