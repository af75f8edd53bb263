/// Length-weighted perplexity statistic accumulated over one epoch.
///
/// `add` takes the un-normalized batch cost (the model's mean cost multiplied
/// back by the batch row count) and the number of predicted tokens; the
/// statistic is `exp(cost_sum / token_sum)`.
#[derive(Debug, Default)]
pub struct PerplexityMeter {
    cost_sum: f64,
    token_sum: u64,
}

impl PerplexityMeter {
    pub fn add(&mut self, batch_cost: f64, tokens: u64) {
        self.cost_sum += batch_cost;
        self.token_sum += tokens;
    }

    pub fn tokens(&self) -> u64 {
        self.token_sum
    }

    /// Running perplexity for progress reporting. Callers must have fed at
    /// least one non-empty batch.
    pub fn running(&self) -> f64 {
        (self.cost_sum / self.token_sum as f64).exp()
    }

    pub fn finalize(self) -> Option<EpochSummary> {
        if self.token_sum == 0 {
            None
        } else {
            let average_loss = self.cost_sum / self.token_sum as f64;
            Some(EpochSummary {
                average_loss,
                perplexity: average_loss.exp(),
                tokens: self.token_sum,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub average_loss: f64,
    pub perplexity: f64,
    pub tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_is_length_weighted() {
        let mut meter = PerplexityMeter::default();
        meter.add(6.0, 2);
        meter.add(2.0, 2);
        let summary = meter.finalize().unwrap();
        assert!((summary.average_loss - 2.0).abs() < 1e-12);
        assert!((summary.perplexity - 2f64.exp()).abs() < 1e-9);
        assert_eq!(summary.tokens, 4);
    }

    #[test]
    fn finalize_without_tokens_is_none() {
        assert!(PerplexityMeter::default().finalize().is_none());
    }
}
