#![no_main]

use devlock_daemon::ipc::{IpcRequest, ServerFrame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    // Request lines come straight off the socket
    if let Ok(request) = serde_json::from_str::<IpcRequest>(line) {
        let _ = request.name();

        let json = serde_json::to_string(&request).unwrap();
        let request2: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request.name(), request2.name());
    }

    // Frames as a client would read them
    if let Ok(frame) = serde_json::from_str::<ServerFrame>(line) {
        let json = serde_json::to_string(&frame).unwrap();
        let _ = serde_json::from_str::<ServerFrame>(&json).unwrap();
    }
});
