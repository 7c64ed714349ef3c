// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream helpers shared by the decode and encode adapters.

pub mod h264;
pub mod h265;
pub mod nalu;
pub mod nalu_writer;
pub mod sei;
pub mod vui;
