use warren_core::branch::{self, ComparisonKind};
use warren_core::edge;
use warren_core::map::CoverageMap;
use warren_core::runtime;

// Branch-site ids for the toy target below, as an instrumentation pass
// would have assigned them.
const SITE_LEN: u32 = 0x10;
const SITE_MAGIC: u32 = 0x11;
const SITE_CHECKSUM: u32 = 0x12;

/// A hand-instrumented toy target: a header check the way a compiler pass
/// would decorate it, so the whole recording pipeline can be watched end to
/// end without building a real target.
fn toy_target(map: &mut CoverageMap, data: &[u8]) {
    edge::record_edge(map, 0x0100);

    branch::record_cmp_i32(map, SITE_LEN, ComparisonKind::SignedGreaterOrEqual, data.len() as i32, 8);
    if data.len() < 8 {
        edge::record_edge(map, 0x0200);
        return;
    }

    edge::record_edge(map, 0x0300);
    branch::record_str_eq_bounded(map, SITE_MAGIC, &data[..4], b"WARN", 4);
    if &data[..4] != b"WARN" {
        edge::record_edge(map, 0x0400);
        return;
    }

    edge::record_edge(map, 0x0500);
    let checksum = data[4..].iter().map(|&b| b as i64).sum::<i64>();
    branch::record_cmp_i64(map, SITE_CHECKSUM, ComparisonKind::Equal, checksum, 0x150);
    if checksum == 0x150 {
        edge::record_edge(map, 0x0600);
    } else {
        edge::record_edge(map, 0x0700);
    }
}

fn main() -> Result<(), anyhow::Error> {
    let mut rt = runtime::init();

    let samples: [&[u8]; 4] = [b"x", b"WARNabcd", b"NOPEnope", b"WARN\x54\x54\x54\x54"];

    let mut executions = 0u64;
    while rt.persistent.iteration(&mut rt.map, 1000) {
        for sample in samples {
            edge::reset_previous_location();
            toy_target(&mut rt.map, sample);
            executions += 1;
        }
    }

    let populated = rt.map.as_slice().iter().filter(|&&b| b != 0).count();
    println!(
        "{} executions ({:?}), {} populated map cells",
        executions,
        rt.role,
        populated
    );
    Ok(())
}
