use tch::Device;

/// Best available accelerator, falling back to CPU.
pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}
