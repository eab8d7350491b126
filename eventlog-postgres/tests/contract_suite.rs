//! Runs every contract suite against PostgreSQL.
//!
//! All tests of this binary share one freshly named events table and one
//! checkpoint table; scenarios isolate themselves with unique stream and
//! subscriber names.

mod common;

use std::sync::OnceLock;

use eventlog_postgres::TableName;
use eventlog_testing::{
    catch_up_contract_tests, checkpoint_storage_contract_tests, event_store_contract_tests,
};

fn events_table() -> &'static TableName {
    static TABLE: OnceLock<TableName> = OnceLock::new();
    TABLE.get_or_init(|| common::unique_table("contract"))
}

fn checkpoints_table() -> &'static TableName {
    static TABLE: OnceLock<TableName> = OnceLock::new();
    TABLE.get_or_init(|| common::unique_table("checkpoint"))
}

event_store_contract_tests! {
    suite = postgres,
    make_store = || crate::common::event_store(crate::events_table()),
}

checkpoint_storage_contract_tests! {
    suite = postgres_checkpoints,
    make_checkpoints = |subscriber_id| {
        crate::common::checkpoint_storage(crate::checkpoints_table(), subscriber_id)
    },
}

catch_up_contract_tests! {
    suite = postgres_catch_up,
    make_store = || crate::common::event_store(crate::events_table()),
    make_checkpoints = |subscriber_id| {
        crate::common::checkpoint_storage(crate::checkpoints_table(), subscriber_id)
    },
}
