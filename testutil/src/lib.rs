// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! In-process stub servers for the Remote Execution API surface, with configurable fault
//! injection. Client test suites run against these rather than a live cluster.

mod stub_cas;
mod stub_execution;

pub use stub_cas::{StubCas, StubCasBuilder};
pub use stub_execution::StubExecution;
