// Shader module loading
//
// Shaders arrive as SPIR-V bytes from the application. The bytes are
// re-read into u32 words, so unaligned buffers (e.g. straight from a file)
// are fine.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;

use super::VulkanDevice;

/// Decode SPIR-V bytes into words, checking the magic number and length
pub fn read_spirv(code: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V")
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = read_spirv(code)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_unaligned_spirv() {
        let mut bytes = vec![0u8];
        for word in [0x0723_0203u32, 0x0001_0000, 0, 1, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }

        let words = read_spirv(&bytes[1..]).unwrap();
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words.len(), 5);
    }

    #[test]
    fn rejects_truncated_code() {
        assert!(read_spirv(&[0x03, 0x02, 0x23]).is_err());
    }
}
