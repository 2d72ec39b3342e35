//! Integration-test member crate; all tests live under `tests/`.
