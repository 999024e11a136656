// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Alignment of buffers handed to the kernel, suitable for `O_DIRECT`.
pub const PAGE: usize = 4096;

/// Returns `true` if `v` is a power of two. Zero is not.
#[inline(always)]
pub fn is_pow2(v: usize) -> bool {
    v != 0 && v & (v - 1) == 0
}

#[inline(always)]
fn debug_assert_pow2(align: usize) {
    debug_assert!(is_pow2(align), "alignment must be a power of two: {align}");
}

/// Returns `true` if `v` is a multiple of `align`.
#[inline(always)]
pub fn is_aligned(align: usize, v: usize) -> bool {
    debug_assert_pow2(align);
    v & (align - 1) == 0
}

/// Panics if `v` is not a multiple of `align`.
#[inline(always)]
pub fn assert_aligned(align: usize, v: usize) {
    assert!(is_aligned(align, v), "align: {align}, v: {v}");
}

/// Rounds `v` up to the next multiple of `align`.
#[inline(always)]
pub fn align_up(align: usize, v: usize) -> usize {
    debug_assert_pow2(align);
    (v + align - 1) & !(align - 1)
}

/// Rounds `v` down to the previous multiple of `align`.
#[inline(always)]
pub fn align_down(align: usize, v: usize) -> usize {
    debug_assert_pow2(align);
    v & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert!(is_pow2(PAGE));
        assert!(!is_pow2(0));
        assert!(!is_pow2(12));

        assert_eq!(align_up(PAGE, 1), PAGE);
        assert_eq!(align_up(PAGE, PAGE), PAGE);
        assert_eq!(align_up(PAGE, PAGE + 1), 2 * PAGE);
        assert_eq!(align_down(PAGE, PAGE - 1), 0);
        assert_eq!(align_down(PAGE, 3 * PAGE + 17), 3 * PAGE);

        assert!(is_aligned(PAGE, 8 * PAGE));
        assert!(!is_aligned(PAGE, 8 * PAGE + 512));
    }

    #[test]
    #[should_panic]
    fn test_assert_aligned() {
        assert_aligned(PAGE, 100);
    }
}
