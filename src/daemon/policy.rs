//! Container eviction policy: per-tier quotas with category tie-breaks.
//!
//! Each cycle the engine receives the running fleet with usage merged in and
//! decides which containers to stop and remove:
//!
//! - exempt containers (monitoring infrastructure) are never scored or evicted;
//! - containers matching no managed category are invisible to the policy;
//! - the **low-usage** tier keeps its `K` lowest-scoring members;
//! - the **high-pressure** tier (high-CPU ∪ high-RAM) keeps `M` members, always
//!   including the cheapest high-CPU and, quota permitting, the cheapest
//!   high-RAM container, then the cheapest of the rest.
//!
//! A tier at or below quota is left untouched. Equal scores keep their input
//! order (stable sort, no secondary key).

#![allow(clippy::cast_precision_loss)]

use serde::Serialize;

use crate::core::config::PolicyConfig;
use crate::monitor::containers::{CategoryRules, Container, ResourceCategory};

const BYTES_PER_MB: f64 = 1_048_576.0;
const CPU_WEIGHT: f64 = 10.0;

/// Memory in MB plus ten points per CPU percent.
#[must_use]
pub fn usage_score(container: &Container) -> f64 {
    container.memory_bytes as f64 / BYTES_PER_MB + container.cpu_percent * CPU_WEIGHT
}

// ──────────────────── plan ────────────────────

/// A managed container with its category and score for this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredContainer {
    pub container: Container,
    pub category: ResourceCategory,
    pub score: f64,
}

/// Full decision for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionPlan {
    /// Low-usage evictions first, then high-pressure evictions.
    pub evict: Vec<ScoredContainer>,
    pub keep: Vec<ScoredContainer>,
    pub exempt: Vec<Container>,
    /// Containers matching no managed category.
    pub unmanaged: Vec<Container>,
}

impl EvictionPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.evict.is_empty()
    }
}

// ──────────────────── engine ────────────────────

#[derive(Debug, Clone)]
pub struct ContainerPolicyEngine {
    rules: CategoryRules,
    keep_low_usage: usize,
    keep_high_pressure: usize,
}

impl ContainerPolicyEngine {
    #[must_use]
    pub const fn new(rules: CategoryRules, keep_low_usage: usize, keep_high_pressure: usize) -> Self {
        Self {
            rules,
            keep_low_usage,
            keep_high_pressure,
        }
    }

    #[must_use]
    pub fn from_config(policy: &PolicyConfig) -> Self {
        Self::new(
            CategoryRules::from_config(policy),
            policy.keep_low_usage,
            policy.keep_high_pressure,
        )
    }

    #[must_use]
    pub const fn rules(&self) -> &CategoryRules {
        &self.rules
    }

    /// Containers to stop and remove this cycle.
    #[must_use]
    pub fn pick_containers_to_delete(&self, containers: &[Container]) -> Vec<Container> {
        self.plan(containers)
            .evict
            .into_iter()
            .map(|scored| scored.container)
            .collect()
    }

    #[must_use]
    pub fn plan(&self, containers: &[Container]) -> EvictionPlan {
        let mut plan = EvictionPlan::default();
        let mut low = Vec::new();
        let mut high = Vec::new();

        for container in containers {
            if self.rules.is_exempt(container) {
                plan.exempt.push(container.clone());
                continue;
            }
            let Some(category) = self.rules.classify(&container.image) else {
                plan.unmanaged.push(container.clone());
                continue;
            };
            let scored = ScoredContainer {
                container: container.clone(),
                category,
                score: usage_score(container),
            };
            match category {
                ResourceCategory::LowUsage => low.push(scored),
                ResourceCategory::HighCpu | ResourceCategory::HighRam => high.push(scored),
            }
        }

        let (low_keep, low_evict) = select_lowest(low, self.keep_low_usage);
        let (high_keep, high_evict) = select_high_pressure(high, self.keep_high_pressure);

        plan.keep.extend(low_keep);
        plan.keep.extend(high_keep);
        plan.evict.extend(low_evict);
        plan.evict.extend(high_evict);
        plan
    }
}

fn sort_by_score(group: &mut [ScoredContainer]) {
    group.sort_by(|a, b| a.score.total_cmp(&b.score));
}

/// Keep the `quota` lowest scores; evict the rest in ascending score order.
fn select_lowest(
    mut group: Vec<ScoredContainer>,
    quota: usize,
) -> (Vec<ScoredContainer>, Vec<ScoredContainer>) {
    if group.len() <= quota {
        return (group, Vec::new());
    }
    sort_by_score(&mut group);
    let evict = group.split_off(quota);
    (group, evict)
}

/// Guarantee one high-CPU and one high-RAM survivor before filling by score.
fn select_high_pressure(
    group: Vec<ScoredContainer>,
    quota: usize,
) -> (Vec<ScoredContainer>, Vec<ScoredContainer>) {
    if group.len() <= quota {
        return (group, Vec::new());
    }

    let cheapest_of = |category: ResourceCategory| {
        group
            .iter()
            .enumerate()
            .filter(|(_, c)| c.category == category)
            // min_by returns the first of equal minima, matching a stable sort.
            .min_by(|(_, a), (_, b)| a.score.total_cmp(&b.score))
            .map(|(idx, _)| idx)
    };

    let mut kept_idx: Vec<usize> = Vec::with_capacity(quota);
    if let Some(idx) = cheapest_of(ResourceCategory::HighCpu) {
        if kept_idx.len() < quota {
            kept_idx.push(idx);
        }
    }
    if let Some(idx) = cheapest_of(ResourceCategory::HighRam) {
        if kept_idx.len() < quota {
            kept_idx.push(idx);
        }
    }

    let mut rest: Vec<usize> = (0..group.len()).filter(|idx| !kept_idx.contains(idx)).collect();
    rest.sort_by(|a, b| group[*a].score.total_cmp(&group[*b].score));
    let room = quota.saturating_sub(kept_idx.len());
    kept_idx.extend(rest.into_iter().take(room));

    let (keep, evict): (Vec<_>, Vec<_>) = group
        .into_iter()
        .enumerate()
        .partition(|(idx, _)| kept_idx.contains(idx));
    (
        keep.into_iter().map(|(_, c)| c).collect(),
        evict.into_iter().map(|(_, c)| c).collect(),
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MIB: u64 = 1_048_576;

    fn engine(keep_low: usize, keep_high: usize) -> ContainerPolicyEngine {
        ContainerPolicyEngine::new(
            CategoryRules::from_config(&PolicyConfig::default()),
            keep_low,
            keep_high,
        )
    }

    /// Container whose score is exactly `mb` (no CPU).
    fn with_score(id: &str, image: &str, mb: u64) -> Container {
        Container::new(id, image, format!("{image}-{id}")).with_usage(0.0, mb * MIB)
    }

    fn ids(containers: &[Container]) -> Vec<&str> {
        containers.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn score_weights_cpu_tenfold() {
        let c = Container::new("a", "img_cpu", "a").with_usage(2.5, 100 * MIB);
        assert!((usage_score(&c) - 125.0).abs() < f64::EPSILON);
    }

    #[test]
    fn low_tier_over_quota_drops_highest() {
        let fleet = vec![
            with_score("a", "img_low", 50),
            with_score("b", "img_low", 10),
            with_score("c", "img_low", 90),
        ];
        let evicted = engine(2, 2).pick_containers_to_delete(&fleet);
        assert_eq!(ids(&evicted), vec!["c"]);
    }

    #[test]
    fn tiers_at_quota_untouched() {
        let fleet = vec![
            with_score("a", "img_low", 500),
            with_score("b", "img_low", 900),
            with_score("c", "img_low", 700),
            with_score("d", "img_cpu", 1),
            with_score("e", "img_ram", 1),
        ];
        assert!(engine(3, 2).plan(&fleet).is_noop());
        assert!(engine(3, 2).pick_containers_to_delete(&[]).is_empty());
    }

    #[test]
    fn high_tier_guarantees_one_of_each() {
        // Both cheapest containers are CPU, but the RAM representative survives.
        let fleet = vec![
            with_score("cpu1", "img_cpu", 10),
            with_score("cpu2", "img_cpu", 20),
            with_score("cpu3", "img_cpu", 30),
            with_score("ram1", "img_ram", 400),
            with_score("ram2", "img_ram", 300),
        ];
        let plan = engine(3, 2).plan(&fleet);
        let kept: Vec<&str> = plan.keep.iter().map(|s| s.container.id.as_str()).collect();
        assert_eq!(kept, vec!["cpu1", "ram2"]);
        let evicted: Vec<&str> = plan.evict.iter().map(|s| s.container.id.as_str()).collect();
        assert_eq!(evicted, vec!["cpu2", "cpu3", "ram1"]);
    }

    #[test]
    fn high_tier_fills_remaining_slots_by_score() {
        let fleet = vec![
            with_score("cpu1", "img_cpu", 10),
            with_score("cpu2", "img_cpu", 20),
            with_score("ram1", "img_ram", 400),
            with_score("ram2", "img_ram", 15),
            with_score("cpu3", "img_cpu", 900),
        ];
        let evicted = engine(3, 3).pick_containers_to_delete(&fleet);
        assert_eq!(ids(&evicted), vec!["ram1", "cpu3"]);
    }

    #[test]
    fn quota_of_one_keeps_cpu_representative() {
        let fleet = vec![
            with_score("ram1", "img_ram", 1),
            with_score("cpu1", "img_cpu", 50),
        ];
        let evicted = engine(3, 1).pick_containers_to_delete(&fleet);
        assert_eq!(ids(&evicted), vec!["ram1"]);
    }

    #[test]
    fn exempt_and_unmanaged_are_invisible() {
        let fleet = vec![
            with_score("g", "grafana/grafana:10", 9000),
            with_score("g2", "img_low", 9000).clone(),
            with_score("a", "img_low", 1),
            with_score("b", "img_low", 2),
            with_score("pg", "postgres:16", 9000),
        ];
        let mut fleet = fleet;
        fleet[1].name = "GRAFANA-agent".to_string();
        let plan = engine(1, 2).plan(&fleet);
        assert_eq!(ids(&plan.exempt), vec!["g", "g2"]);
        assert_eq!(ids(&plan.unmanaged), vec!["pg"]);
        let evicted: Vec<&str> = plan.evict.iter().map(|s| s.container.id.as_str()).collect();
        assert_eq!(evicted, vec!["b"]);
    }

    #[test]
    fn equal_scores_keep_input_order() {
        let fleet = vec![
            with_score("first", "img_low", 5),
            with_score("second", "img_low", 5),
            with_score("third", "img_low", 5),
        ];
        let evicted = engine(2, 2).pick_containers_to_delete(&fleet);
        assert_eq!(ids(&evicted), vec!["third"]);
    }

    // ──────────────────── properties ────────────────────

    fn arb_image() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("img_low"),
            Just("img_cpu"),
            Just("img_ram"),
            Just("grafana/img_low"),
            Just("redis:7"),
        ]
    }

    fn arb_fleet() -> impl Strategy<Value = Vec<Container>> {
        prop::collection::vec((arb_image(), 0.0f64..400.0, 0u64..(8 * 1024 * MIB)), 0..24).prop_map(
            |specs| {
                specs
                    .into_iter()
                    .enumerate()
                    .map(|(idx, (image, cpu, mem))| {
                        Container::new(format!("c{idx}"), image, format!("n{idx}")).with_usage(cpu, mem)
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Every managed container is either kept or evicted, never both.
        #[test]
        fn plan_partitions_managed_fleet(fleet in arb_fleet(), k in 1usize..5, m in 1usize..5) {
            let plan = engine(k, m).plan(&fleet);
            prop_assert_eq!(
                plan.keep.len() + plan.evict.len() + plan.exempt.len() + plan.unmanaged.len(),
                fleet.len()
            );
            for kept in &plan.keep {
                prop_assert!(plan.evict.iter().all(|e| e.container.id != kept.container.id));
            }
        }

        #[test]
        fn under_quota_evicts_nothing(fleet in arb_fleet()) {
            let big = fleet.len().max(1);
            prop_assert!(engine(big, big).pick_containers_to_delete(&fleet).is_empty());
        }

        /// Evicted low-usage scores are never below kept low-usage scores.
        #[test]
        fn low_tier_evicts_heaviest(fleet in arb_fleet(), k in 1usize..5) {
            let plan = engine(k, 100).plan(&fleet);
            let low_total = plan
                .keep
                .iter()
                .chain(&plan.evict)
                .filter(|s| s.category == ResourceCategory::LowUsage)
                .count();
            let evicted: Vec<f64> = plan.evict.iter().map(|s| s.score).collect();
            let kept_low: Vec<f64> = plan
                .keep
                .iter()
                .filter(|s| s.category == ResourceCategory::LowUsage)
                .map(|s| s.score)
                .collect();
            prop_assert_eq!(evicted.len(), low_total.saturating_sub(k));
            for e in &evicted {
                for kept in &kept_low {
                    prop_assert!(e >= kept);
                }
            }
        }

        #[test]
        fn high_tier_keeps_cheapest_of_each_kind(fleet in arb_fleet(), m in 2usize..5) {
            let plan = engine(100, m).plan(&fleet);
            let high: Vec<&ScoredContainer> = plan
                .keep
                .iter()
                .chain(&plan.evict)
                .filter(|s| s.category != ResourceCategory::LowUsage)
                .collect();
            prop_assert_eq!(
                plan.keep.iter().filter(|s| s.category != ResourceCategory::LowUsage).count(),
                high.len().min(m)
            );
            for category in [ResourceCategory::HighCpu, ResourceCategory::HighRam] {
                let min_score = high
                    .iter()
                    .filter(|s| s.category == category)
                    .map(|s| s.score)
                    .min_by(f64::total_cmp);
                if let Some(min_score) = min_score {
                    prop_assert!(
                        plan.keep
                            .iter()
                            .any(|s| s.category == category && s.score == min_score),
                        "cheapest {:?} must survive", category
                    );
                }
            }
        }

        #[test]
        fn exempt_never_evicted(fleet in arb_fleet(), k in 1usize..3, m in 1usize..3) {
            let evicted = engine(k, m).pick_containers_to_delete(&fleet);
            prop_assert!(evicted.iter().all(|c| !c.image.contains("grafana")));
        }
    }
}
