//! Field-pairing arithmetic.
//!
//! A display entry stands for one physical decode. Consumers present it
//! once for a progressive frame, twice for a field pair, and once more for
//! every repeated first field (telecine pulldown).

use vs_common::FieldPass;

/// Number of presentation passes for one display entry.
pub fn presentation_passes(progressive: bool, repeat_first_field: u32) -> u32 {
    if progressive {
        1
    } else {
        2u32.saturating_add(repeat_first_field)
    }
}

/// The passes for one entry, in presentation order.
pub fn field_passes(
    progressive: bool,
    top_field_first: bool,
    repeat_first_field: u32,
) -> impl Iterator<Item = FieldPass> {
    let count = presentation_passes(progressive, repeat_first_field);
    (0..count).map(move |index| FieldPass {
        index,
        count,
        progressive,
        top_field_first,
    })
}
