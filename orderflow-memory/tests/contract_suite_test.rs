use orderflow_memory::InMemoryOrderLedger;
use orderflow_testing::order_ledger_contract_tests;

order_ledger_contract_tests!(suite = in_memory, make_ledger = InMemoryOrderLedger::new);
