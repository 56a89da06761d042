// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Criterion benchmarks for the `tensor_vm` runtime.
//!
//! The benchmarks live in `benches/vm.rs`; this crate has no library code.
