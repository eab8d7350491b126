//! Runs every contract suite against the in-memory backend.
//!
//! New scenarios added to the suites are picked up here without changes.

use eventlog_memory::{InMemoryCheckpoints, InMemoryEventStore};
use eventlog_testing::{
    catch_up_contract_tests, checkpoint_storage_contract_tests, event_store_contract_tests,
};

event_store_contract_tests! {
    suite = in_memory,
    make_store = InMemoryEventStore::new,
}

checkpoint_storage_contract_tests! {
    suite = in_memory_checkpoints,
    make_checkpoints = {
        let registry = InMemoryCheckpoints::new();
        move |subscriber_id| registry.storage(subscriber_id)
    },
}

catch_up_contract_tests! {
    suite = in_memory_catch_up,
    make_store = InMemoryEventStore::new,
    make_checkpoints = {
        let registry = InMemoryCheckpoints::new();
        move |subscriber_id| registry.storage(subscriber_id)
    },
}
