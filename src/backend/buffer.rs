// Buffer primitives
//
// Raw buffer creation, memory selection, host writes, and staged uploads
// into device-local memory. Everything here hands back raw handles; the
// owning types in the scene layer are responsible for destruction.

use ash::vk;

use super::device::DeviceContext;
use super::error::{BackendError, Result};

/// Picks the lowest-indexed memory type allowed by `type_filter` that carries
/// all of the requested property flags.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    for i in 0..memory_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        if has_type && has_properties {
            return Ok(i);
        }
    }
    Err(BackendError::NoSuitableMemoryType {
        type_filter,
        properties,
    })
}

/// Creates a buffer and binds fresh memory to it. On any failure the handles
/// created so far are destroyed before the error is returned.
pub fn create_buffer(
    device: &DeviceContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .map_err(BackendError::BufferCreation)?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let memory_type_index = match find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    ) {
        Ok(index) => index,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(BackendError::MemoryAllocation(e));
        }
    };

    if let Err(e) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            device.device.destroy_buffer(buffer, None);
            device.device.free_memory(memory, None);
        }
        return Err(BackendError::MemoryBind(e));
    }

    Ok((buffer, memory))
}

/// Maps host-visible memory, copies `data` into it, and unmaps. The memory
/// must have been allocated HOST_VISIBLE | HOST_COHERENT.
pub fn write_memory<T: bytemuck::Pod>(
    device: &DeviceContext,
    memory: vk::DeviceMemory,
    data: &[T],
) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    write_memory_bytes(device, memory, 0, bytes)
}

/// Byte-level variant of [`write_memory`] with an offset, for aligned UBO
/// arrays whose stride exceeds the element size.
pub fn write_memory_bytes(
    device: &DeviceContext,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    bytes: &[u8],
) -> Result<()> {
    unsafe {
        let ptr = device
            .device
            .map_memory(
                memory,
                offset,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .map_err(BackendError::MemoryMap)? as *mut u8;
        ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        device.device.unmap_memory(memory);
    }
    Ok(())
}

/// Uploads `data` into a new DEVICE_LOCAL buffer through a throwaway staging
/// buffer. Used for vertex and index data that never changes after load.
pub fn create_device_local_buffer<T: bytemuck::Pod>(
    device: &DeviceContext,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;

    let (staging_buffer, staging_memory) = create_buffer(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    let destroy_staging = |device: &DeviceContext| unsafe {
        device.device.destroy_buffer(staging_buffer, None);
        device.device.free_memory(staging_memory, None);
    };

    if let Err(e) = write_memory(device, staging_memory, data) {
        destroy_staging(device);
        return Err(e);
    }

    let (buffer, memory) = match create_buffer(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_DST | usage,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ) {
        Ok(created) => created,
        Err(e) => {
            destroy_staging(device);
            return Err(e);
        }
    };

    let copy_result = copy_buffer(device, staging_buffer, buffer, size);
    destroy_staging(device);
    if let Err(e) = copy_result {
        unsafe {
            device.device.destroy_buffer(buffer, None);
            device.device.free_memory(memory, None);
        }
        return Err(e);
    }

    Ok((buffer, memory))
}

fn copy_buffer(
    device: &DeviceContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    one_shot_commands(device, |cmd| {
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe { device.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    })
}

/// Records commands into a single-use command buffer, submits it on the
/// graphics queue, and waits for the queue to drain before freeing it.
/// Fine for load-time transfers, far too slow for anything per-frame.
pub fn one_shot_commands<F>(device: &DeviceContext, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(device.command_pool)
        .command_buffer_count(1);
    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .map_err(BackendError::OneShotCommand)?[0];

    let free = |device: &DeviceContext| unsafe {
        device
            .device
            .free_command_buffers(device.command_pool, &[command_buffer]);
    };

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    if let Err(e) = unsafe { device.device.begin_command_buffer(command_buffer, &begin_info) } {
        free(device);
        return Err(BackendError::OneShotCommand(e));
    }

    record(command_buffer);

    if let Err(e) = unsafe { device.device.end_command_buffer(command_buffer) } {
        free(device);
        return Err(BackendError::OneShotCommand(e));
    }

    let buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers).build();
    let submit = unsafe {
        device
            .device
            .queue_submit(device.graphics_queue, &[submit_info], vk::Fence::null())
            .and_then(|_| device.device.queue_wait_idle(device.graphics_queue))
    };
    free(device);
    submit.map_err(BackendError::OneShotCommand)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_matching_memory_type() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let index = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn respects_type_filter_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        // Bit 0 excluded, so type 1 must win even though type 0 matches.
        let index = find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn fails_when_nothing_matches() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, BackendError::NoSuitableMemoryType { .. }));
    }
}
