use anyhow::Result;
use pcm_bridge::audio;

pub(crate) fn list_input_devices() -> Result<()> {
    // PCM_BRIDGE_TEST_DEVICES stands in for real hardware in tests
    let devices = if let Ok(raw) = std::env::var("PCM_BRIDGE_TEST_DEVICES") {
        parse_test_devices(&raw)
    } else {
        audio::list_input_devices().unwrap_or_else(|err| {
            eprintln!("Failed to list audio input devices: {err:#}");
            Vec::new()
        })
    };

    if devices.is_empty() {
        println!("No audio input devices detected.");
    } else {
        println!("Available audio input devices:");
        for (index, name) in devices {
            println!("  {index}: {name}");
        }
    }
    Ok(())
}

fn parse_test_devices(raw: &str) -> Vec<(usize, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .enumerate()
        .map(|(index, name)| (index, name.to_string()))
        .collect()
}
