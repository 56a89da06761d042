// Copyright 2026 the Tensor VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end conformance tests for the `tensor_vm` runtime.
//!
//! The tests live in `tests/conformance.rs`; this crate has no library code.
