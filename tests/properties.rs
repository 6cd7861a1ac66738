use proptest::prelude::*;
use wallet_eng::{Amount, Engine, EngineConfig, LedgerEntry, TxKind, UserId};

fn request() -> impl Strategy<Value = (UserId, TxKind, i64)> {
    let kind = prop_oneof![
        Just(TxKind::Deposit),
        Just(TxKind::Withdrawal),
        Just(TxKind::Adjustment),
    ];
    (1..4u64, kind, -1_000..1_000i64)
}

fn run(requests: &[(UserId, TxKind, i64)]) -> Engine {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let engine = Engine::in_memory(EngineConfig::default());
    runtime.block_on(async {
        for (n, &(user, kind, amount)) in requests.iter().enumerate() {
            // replay every third request under the id of the previous one
            let id = if n % 3 == 2 { n - 1 } else { n };
            engine
                .submit(user, Amount::from_minor(amount), kind, format!("r{id}"))
                .await
                .unwrap();
        }
    });
    engine
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_equals_sum_of_entries(requests in prop::collection::vec(request(), 0..60)) {
        let engine = run(&requests);

        for user in 1..4u64 {
            let entries: Vec<LedgerEntry> = engine
                .get_history(user, None, None)
                .collect::<Result<_, _>>()
                .unwrap();

            let mut running = Amount::ZERO;
            let mut last_id = 0;
            for entry in &entries {
                prop_assert!(entry.entry_id > last_id);
                last_id = entry.entry_id;
                running += entry.amount;
                prop_assert_eq!(entry.resulting_balance, running);
                if entry.kind == TxKind::Withdrawal {
                    prop_assert!(!entry.resulting_balance.is_negative());
                }
            }

            let account = engine.get_account(user).unwrap();
            prop_assert_eq!(account.balance, running);
            prop_assert_eq!(account.version, entries.len() as u64);
        }
    }

    #[test]
    fn request_ids_are_unique_in_the_ledger(requests in prop::collection::vec(request(), 0..60)) {
        let engine = run(&requests);

        for user in 1..4u64 {
            let mut ids: Vec<String> = engine
                .get_history(user, None, None)
                .map(|e| e.unwrap().request_id.to_string())
                .collect();
            let before = ids.len();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), before);
        }
    }
}
