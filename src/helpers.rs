// Small shared helpers for pNext chains and Vulkan's two-call
// array query idiom.
use ash::vk;
use std::os::raw::c_void;

/// Find a structure of the given sType in a const pNext chain.
///
/// The caller asserts that `T` is the struct matching `s_type`.
pub unsafe fn find_in_chain<T>(head: *const c_void, s_type: vk::StructureType) -> Option<&'static T> {
    let mut next = head as *const vk::BaseInStructure;
    while !next.is_null() {
        if (*next).s_type == s_type {
            return Some(&*(next as *const T));
        }
        next = (*next).p_next as *const vk::BaseInStructure;
    }
    None
}

/// Find a structure of the given sType in a mutable pNext chain.
pub unsafe fn find_in_chain_mut<T>(
    head: *mut c_void,
    s_type: vk::StructureType,
) -> Option<&'static mut T> {
    let mut next = head as *mut vk::BaseOutStructure;
    while !next.is_null() {
        if (*next).s_type == s_type {
            return Some(&mut *(next as *mut T));
        }
        next = (*next).p_next as *mut vk::BaseOutStructure;
    }
    None
}

/// Fill a caller provided array using Vulkan's count/pointer idiom.
///
/// With a null output pointer the element count is returned. With a
/// short array as many elements as fit are written and VK_INCOMPLETE
/// is returned.
pub unsafe fn fill_vk_array<T: Copy>(src: &[T], count: *mut u32, out: *mut T) -> vk::Result {
    assert!(!count.is_null());
    if out.is_null() {
        *count = src.len() as u32;
        return vk::Result::SUCCESS;
    }

    let capacity = *count as usize;
    let written = std::cmp::min(capacity, src.len());
    for (i, item) in src.iter().take(written).enumerate() {
        *out.add(i) = *item;
    }
    *count = written as u32;

    if written < src.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_query_two_call() {
        let src = [10u32, 20, 30];
        let mut count = 0u32;
        unsafe {
            assert_eq!(
                fill_vk_array(&src, &mut count, std::ptr::null_mut()),
                vk::Result::SUCCESS
            );
        }
        assert_eq!(count, 3);

        let mut out = [0u32; 3];
        unsafe {
            assert_eq!(
                fill_vk_array(&src, &mut count, out.as_mut_ptr()),
                vk::Result::SUCCESS
            );
        }
        assert_eq!(out, [10, 20, 30]);
    }

    #[test]
    fn array_query_short_buffer() {
        let src = [1u32, 2, 3, 4];
        let mut count = 2u32;
        let mut out = [0u32; 2];
        unsafe {
            assert_eq!(
                fill_vk_array(&src, &mut count, out.as_mut_ptr()),
                vk::Result::INCOMPLETE
            );
        }
        assert_eq!(count, 2);
        assert_eq!(out, [1, 2]);
    }
}
