//! 反思分析：根据本轮结果决定继续还是停止（纯函数，无 I/O）
//!
//! 判定顺序（先命中者生效）：
//! 1. 反思声明完成 → ReflectionComplete
//! 2. iteration >= max_iterations → MaxIterations
//! 3. iteration > 1 且结果键集合与本轮开始前相同 → NoProgress
//! 4. 本轮 Plan 与 Reflect 都超时 → Timeout
//! 5. confidence > 阈值（默认 0.9） → HighConfidence
//! 6. 否则继续，携带由反思派生的指导

use std::collections::BTreeSet;

use crate::core::metrics::StopReason;
use crate::phases::types::Reflection;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Continue { guidance: Option<String> },
    Stop(StopReason),
}

/// 一轮迭代结束时的观测
#[derive(Debug, Clone, Copy)]
pub struct IterationOutcome<'a> {
    pub iteration: usize,
    pub max_iterations: usize,
    pub reflection: &'a Reflection,
    pub keys_before: &'a BTreeSet<String>,
    pub keys_after: &'a BTreeSet<String>,
    pub plan_timed_out: bool,
    pub reflect_timed_out: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReflectionAnalyzer {
    pub high_confidence: f64,
}

impl Default for ReflectionAnalyzer {
    fn default() -> Self {
        Self {
            high_confidence: 0.9,
        }
    }
}

impl ReflectionAnalyzer {
    pub fn analyze(&self, o: &IterationOutcome<'_>) -> Verdict {
        if o.reflection.is_complete {
            return Verdict::Stop(StopReason::ReflectionComplete);
        }
        if o.iteration >= o.max_iterations {
            return Verdict::Stop(StopReason::MaxIterations);
        }
        if o.iteration > 1 && o.keys_before == o.keys_after {
            return Verdict::Stop(StopReason::NoProgress);
        }
        if o.plan_timed_out && o.reflect_timed_out {
            return Verdict::Stop(StopReason::Timeout);
        }
        if o.reflection.confidence.is_some_and(|c| c > self.high_confidence) {
            return Verdict::Stop(StopReason::HighConfidence);
        }
        Verdict::Continue {
            guidance: o.reflection.guidance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ks: &[&str]) -> BTreeSet<String> {
        ks.iter().map(|s| s.to_string()).collect()
    }

    fn outcome<'a>(
        iteration: usize,
        reflection: &'a Reflection,
        before: &'a BTreeSet<String>,
        after: &'a BTreeSet<String>,
    ) -> IterationOutcome<'a> {
        IterationOutcome {
            iteration,
            max_iterations: 5,
            reflection,
            keys_before: before,
            keys_after: after,
            plan_timed_out: false,
            reflect_timed_out: false,
        }
    }

    #[test]
    fn test_complete_wins_first() {
        let r = Reflection {
            is_complete: true,
            ..Default::default()
        };
        let (b, a) = (keys(&[]), keys(&["iter1_a"]));
        let mut o = outcome(1, &r, &b, &a);
        assert_eq!(
            ReflectionAnalyzer::default().analyze(&o),
            Verdict::Stop(StopReason::ReflectionComplete)
        );
        o.iteration = 5;
        assert_eq!(
            ReflectionAnalyzer::default().analyze(&o),
            Verdict::Stop(StopReason::ReflectionComplete)
        );
    }

    #[test]
    fn test_max_iterations() {
        let r = Reflection::inconclusive("unsure");
        let (b, a) = (keys(&[]), keys(&["iter1_a"]));
        let mut o = outcome(1, &r, &b, &a);
        o.max_iterations = 1;
        assert_eq!(
            ReflectionAnalyzer::default().analyze(&o),
            Verdict::Stop(StopReason::MaxIterations)
        );
    }

    #[test]
    fn test_no_progress_only_after_first_iteration() {
        let r = Reflection::inconclusive("unsure");
        let same = keys(&["iter1_a"]);
        let analyzer = ReflectionAnalyzer::default();
        assert_eq!(
            analyzer.analyze(&outcome(2, &r, &same, &same)),
            Verdict::Stop(StopReason::NoProgress)
        );
        assert_eq!(
            analyzer.analyze(&outcome(1, &r, &same, &same)),
            Verdict::Continue { guidance: None }
        );
    }

    #[test]
    fn test_both_timeouts_stop_with_timeout() {
        let r = Reflection::inconclusive("timed out");
        let (b, a) = (keys(&[]), keys(&["iter1_x"]));
        let mut o = outcome(1, &r, &b, &a);
        o.plan_timed_out = true;
        o.reflect_timed_out = true;
        assert_eq!(
            ReflectionAnalyzer::default().analyze(&o),
            Verdict::Stop(StopReason::Timeout)
        );
        o.plan_timed_out = false;
        assert!(matches!(
            ReflectionAnalyzer::default().analyze(&o),
            Verdict::Continue { .. }
        ));
    }

    #[test]
    fn test_high_confidence_and_guidance() {
        let (b, a) = (keys(&[]), keys(&["iter1_a"]));
        let confident = Reflection {
            confidence: Some(0.95),
            ..Default::default()
        };
        assert_eq!(
            ReflectionAnalyzer::default().analyze(&outcome(1, &confident, &b, &a)),
            Verdict::Stop(StopReason::HighConfidence)
        );

        let borderline = Reflection {
            confidence: Some(0.9),
            suggested_next_steps: "look up the population".into(),
            ..Default::default()
        };
        assert_eq!(
            ReflectionAnalyzer::default().analyze(&outcome(1, &borderline, &b, &a)),
            Verdict::Continue {
                guidance: Some("look up the population".into())
            }
        );
    }
}
