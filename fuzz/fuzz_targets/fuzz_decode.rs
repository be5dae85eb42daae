#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must never panic.
    if let Ok((mut graph, _params)) = sgfuse_proto::decode_model(data) {
        // Any graph that decodes is valid, so fusion must not panic either.
        let _ = sgfuse_opt::optimize(&mut graph);
    }
});
