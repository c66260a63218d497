use mallhub_api::services::loyalty::plan_point_deductions;
use proptest::prelude::*;
use std::collections::HashSet;
use uuid::Uuid;

fn store(index: usize) -> Uuid {
    Uuid::from_u128(index as u128 + 1)
}

proptest! {
    /// Deduction plans take exactly the affordable amount, never overdraw a
    /// store, and never touch a store twice.
    #[test]
    fn plans_conserve_points_and_never_overdraw(
        raw_balances in prop::collection::vec(0i64..10_000, 1..8),
        required_ratio in 0.0f64..1.5,
        home_index in prop::option::of(0usize..8),
    ) {
        let balances: Vec<(Uuid, i64)> = raw_balances
            .iter()
            .enumerate()
            .map(|(i, b)| (store(i), *b))
            .collect();
        let total: i64 = balances.iter().map(|(_, b)| *b).sum();
        let required = (total as f64 * required_ratio) as i64;
        let home = home_index.and_then(|i| balances.get(i).map(|(id, _)| *id));

        let plan = plan_point_deductions(&balances, home, required);

        let deducted: i64 = plan.iter().map(|d| d.amount).sum();
        prop_assert_eq!(deducted, required.clamp(0, total));

        let mut seen = HashSet::new();
        for step in &plan {
            prop_assert!(seen.insert(step.store_id), "store deducted twice");
            let (_, balance) = balances
                .iter()
                .find(|(id, _)| *id == step.store_id)
                .expect("plan only names known stores");
            prop_assert!(step.amount > 0);
            prop_assert!(step.amount <= *balance);
        }
    }

    /// The prize's own store is always the first to be drained whenever the
    /// user holds a balance there.
    #[test]
    fn home_store_is_drained_first(
        raw_balances in prop::collection::vec(1i64..10_000, 1..8),
        home_index in 0usize..8,
        required in 1i64..20_000,
    ) {
        let balances: Vec<(Uuid, i64)> = raw_balances
            .iter()
            .enumerate()
            .map(|(i, b)| (store(i), *b))
            .collect();
        prop_assume!(home_index < balances.len());
        let home = balances[home_index].0;

        let plan = plan_point_deductions(&balances, Some(home), required);

        prop_assert!(!plan.is_empty());
        prop_assert_eq!(plan[0].store_id, home);

        // The remainder is ordered by descending balance
        let amounts: Vec<i64> = plan
            .iter()
            .skip(1)
            .map(|step| {
                balances
                    .iter()
                    .find(|(id, _)| *id == step.store_id)
                    .map(|(_, b)| *b)
                    .unwrap_or(0)
            })
            .collect();
        for window in amounts.windows(2) {
            prop_assert!(window[0] >= window[1]);
        }
    }
}
