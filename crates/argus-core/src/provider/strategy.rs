//! Provider selection strategies (spec §4.3).
//!
//! All strategies operate over a snapshot of currently-available providers,
//! already sorted by `priority` ascending by the caller. The random source
//! backing `intelligent` is injected so tests can make selection
//! deterministic (spec §9: "isolate the random source").

use rand::Rng;

use super::types::SelectionStrategy;

/// Read-only snapshot of one available provider, sufficient for selection.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailableProvider {
    pub id: String,
    pub priority: i32,
    pub success_rate: f64,
    pub speed_factor: f64,
    pub avg_response_time_secs: Option<f64>,
}

pub fn select<'a>(
    strategy: SelectionStrategy,
    available: &'a [AvailableProvider],
    round_robin_index: usize,
    rng: &mut dyn rand::RngCore,
) -> Option<&'a AvailableProvider> {
    match strategy {
        SelectionStrategy::Priority => select_priority(available),
        SelectionStrategy::RoundRobin => select_round_robin(available, round_robin_index),
        SelectionStrategy::Intelligent => select_intelligent(available, rng),
        SelectionStrategy::Fastest => select_fastest(available),
    }
}

fn select_priority(available: &[AvailableProvider]) -> Option<&AvailableProvider> {
    available.first()
}

fn select_round_robin(available: &[AvailableProvider], index: usize) -> Option<&AvailableProvider> {
    if available.is_empty() {
        None
    } else {
        Some(&available[index % available.len()])
    }
}

fn select_fastest(available: &[AvailableProvider]) -> Option<&AvailableProvider> {
    available.iter().min_by(|a, b| {
        let a_time = a.avg_response_time_secs.unwrap_or(f64::INFINITY);
        let b_time = b.avg_response_time_secs.unwrap_or(f64::INFINITY);
        a_time
            .partial_cmp(&b_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn select_intelligent<'a>(
    available: &'a [AvailableProvider],
    rng: &mut dyn rand::RngCore,
) -> Option<&'a AvailableProvider> {
    if available.is_empty() {
        return None;
    }

    let weights: Vec<f64> = available
        .iter()
        .map(|p| 0.7 * p.success_rate + 0.3 * p.speed_factor)
        .collect();
    let total: f64 = weights.iter().sum();

    if total <= 0.0 {
        let idx = rng.gen_range(0..available.len());
        return Some(&available[idx]);
    }

    let mut roll = rng.gen_range(0.0..total);
    for (provider, weight) in available.iter().zip(weights.iter()) {
        if roll < *weight {
            return Some(provider);
        }
        roll -= weight;
    }
    available.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn provider(id: &str, priority: i32) -> AvailableProvider {
        AvailableProvider {
            id: id.to_string(),
            priority,
            success_rate: 0.5,
            speed_factor: 1.0,
            avg_response_time_secs: None,
        }
    }

    #[test]
    fn priority_picks_lowest_priority_int() {
        let providers = vec![provider("a", 2), provider("b", 1)];
        // Caller is responsible for sorting by priority; simulate that here.
        let mut sorted = providers.clone();
        sorted.sort_by_key(|p| p.priority);
        let mut rng = StepRng::new(0, 1);
        let chosen = select(SelectionStrategy::Priority, &sorted, 0, &mut rng).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn round_robin_cycles_through_providers() {
        let providers = vec![provider("a", 1), provider("b", 2), provider("c", 3)];
        let mut rng = StepRng::new(0, 1);
        assert_eq!(
            select(SelectionStrategy::RoundRobin, &providers, 0, &mut rng)
                .unwrap()
                .id,
            "a"
        );
        assert_eq!(
            select(SelectionStrategy::RoundRobin, &providers, 1, &mut rng)
                .unwrap()
                .id,
            "b"
        );
        assert_eq!(
            select(SelectionStrategy::RoundRobin, &providers, 3, &mut rng)
                .unwrap()
                .id,
            "a"
        );
    }

    #[test]
    fn fastest_picks_lowest_avg_response_time() {
        let mut slow = provider("slow", 1);
        slow.avg_response_time_secs = Some(2.0);
        let mut fast = provider("fast", 2);
        fast.avg_response_time_secs = Some(0.2);
        let no_data = provider("no-data", 3);

        let providers = vec![slow, fast, no_data];
        let mut rng = StepRng::new(0, 1);
        let chosen = select(SelectionStrategy::Fastest, &providers, 0, &mut rng).unwrap();
        assert_eq!(chosen.id, "fast");
    }

    #[test]
    fn intelligent_falls_back_to_uniform_when_all_weights_zero() {
        let mut a = provider("a", 1);
        a.success_rate = 0.0;
        a.speed_factor = 0.0;
        let mut b = provider("b", 2);
        b.success_rate = 0.0;
        b.speed_factor = 0.0;
        let providers = vec![a, b];

        let mut rng = StepRng::new(0, 1);
        let chosen = select(SelectionStrategy::Intelligent, &providers, 0, &mut rng);
        assert!(chosen.is_some());
    }

    #[test]
    fn intelligent_is_deterministic_given_injected_rng() {
        let providers = vec![provider("a", 1), provider("b", 2)];
        let mut rng1 = StepRng::new(42, 7);
        let mut rng2 = StepRng::new(42, 7);
        let c1 = select(SelectionStrategy::Intelligent, &providers, 0, &mut rng1).unwrap();
        let c2 = select(SelectionStrategy::Intelligent, &providers, 0, &mut rng2).unwrap();
        assert_eq!(c1.id, c2.id);
    }

    #[test]
    fn empty_slice_returns_none_for_every_strategy() {
        let empty: Vec<AvailableProvider> = vec![];
        let mut rng = StepRng::new(0, 1);
        for s in [
            SelectionStrategy::Priority,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::Intelligent,
            SelectionStrategy::Fastest,
        ] {
            assert!(select(s, &empty, 0, &mut rng).is_none());
        }
    }
}
