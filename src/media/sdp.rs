//! Small SDP rewrites applied before a description reaches the engine.

/// Writes `b=AS:<kbps>` into every video media section, replacing any
/// bandwidth line already there. Other sections are untouched.
pub fn cap_video_bandwidth(sdp: &str, kbps: u32) -> String {
    let trailing = sdp.ends_with('\n');
    let lines: Vec<&str> = sdp.lines().collect();
    let bandwidth = format!("b=AS:{}", kbps);

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 2);
    let mut in_video = false;
    let mut pending = false;

    for line in lines {
        if line.starts_with("m=") {
            if pending {
                out.push(&bandwidth);
            }
            in_video = line.starts_with("m=video");
            pending = in_video;
            out.push(line);
            continue;
        }
        if !in_video {
            out.push(line);
            continue;
        }
        if line.starts_with("b=AS:") {
            continue;
        }
        // b= follows the optional i= and c= lines of a media section.
        if pending && !line.starts_with("i=") && !line.starts_with("c=") {
            out.push(&bandwidth);
            pending = false;
        }
        out.push(line);
    }
    if pending {
        out.push(&bandwidth);
    }

    let mut result = out.join("\r\n");
    if trailing {
        result.push_str("\r\n");
    }
    result
}
