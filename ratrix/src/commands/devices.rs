use anyhow::Result;

pub fn devices_handler() -> Result<()> {
    print_devices()
}

#[cfg(target_os = "linux")]
fn print_devices() -> Result<()> {
    let devices = ratrix_core::capture::list_devices()?;
    if devices.is_empty() {
        println!("No capture devices found.");
    }
    for device in devices {
        println!("{:>3}  {:<16} {}", device.index, device.path.display(), device.name);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn print_devices() -> Result<()> {
    Err(ratrix_core::capture::CaptureError::Unsupported.into())
}
