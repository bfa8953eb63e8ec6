pub mod common;

mod claim_tests;
mod dispatch_tests;
mod ledger_tests;
mod queue_tests;
mod schedule_tests;
