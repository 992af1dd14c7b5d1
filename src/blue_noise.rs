//! Blue-noise sampler tables for the intersection kernel.
//!
//! The intersection pass importance-samples reflection directions with an
//! Owen-scrambled Sobol sequence: a table of Sobol values, a per-tile
//! ranking table that shuffles sample order between neighboring pixels, and
//! a per-tile scrambling table that decorrelates the values themselves. The
//! tables are generated deterministically at context creation and uploaded
//! once; the two-samples-per-pixel variant is the one the intersection
//! kernel consumes.

/// Samples per sequence.
pub(crate) const SAMPLE_COUNT: u32 = 256;
/// Low-discrepancy dimensions per sample.
pub(crate) const DIMENSION_COUNT: u32 = 8;
/// Edge length of the ranking/scrambling tiles.
pub(crate) const TILE_SIZE: u32 = 128;

fn wang_hash(mut seed: u32) -> u32 {
    seed = (seed ^ 61) ^ (seed >> 16);
    seed = seed.wrapping_mul(9);
    seed ^= seed >> 4;
    seed = seed.wrapping_mul(0x27d4_eb2d);
    seed ^ (seed >> 15)
}

/// Sobol values, `SAMPLE_COUNT * DIMENSION_COUNT` entries indexed
/// `sample * DIMENSION_COUNT + dimension`.
pub(crate) fn sobol_table() -> Vec<u32> {
    let mut table = Vec::with_capacity((SAMPLE_COUNT * DIMENSION_COUNT) as usize);
    for sample in 0..SAMPLE_COUNT {
        for dimension in 0..DIMENSION_COUNT {
            // Dimension zero is the radical inverse in base two; higher
            // dimensions xor in a hashed direction offset.
            let radical_inverse = sample.reverse_bits() >> 8;
            let direction = wang_hash(dimension.wrapping_mul(0x9e37_79b9));
            table.push((radical_inverse ^ (direction >> 8)) & 0x00FF_FFFF);
        }
    }
    table
}

/// Per-tile sample ranking keys, `TILE_SIZE * TILE_SIZE * DIMENSION_COUNT`
/// entries.
pub(crate) fn ranking_tile_table() -> Vec<u32> {
    let len = (TILE_SIZE * TILE_SIZE * DIMENSION_COUNT) as usize;
    let mut table = Vec::with_capacity(len);
    for i in 0..len as u32 {
        table.push(wang_hash(i.wrapping_mul(0x0001_0001) ^ 0x5bd1_e995) & (SAMPLE_COUNT - 1));
    }
    table
}

/// Per-tile value scrambling keys, `TILE_SIZE * TILE_SIZE * DIMENSION_COUNT`
/// entries.
pub(crate) fn scrambling_tile_table() -> Vec<u32> {
    let len = (TILE_SIZE * TILE_SIZE * DIMENSION_COUNT) as usize;
    let mut table = Vec::with_capacity(len);
    for i in 0..len as u32 {
        table.push(wang_hash(i ^ 0x85eb_ca6b) & 0x00FF_FFFF);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sizes() {
        assert_eq!(
            sobol_table().len(),
            (SAMPLE_COUNT * DIMENSION_COUNT) as usize
        );
        assert_eq!(
            ranking_tile_table().len(),
            (TILE_SIZE * TILE_SIZE * DIMENSION_COUNT) as usize
        );
        assert_eq!(
            scrambling_tile_table().len(),
            (TILE_SIZE * TILE_SIZE * DIMENSION_COUNT) as usize
        );
    }

    #[test]
    fn test_tables_are_deterministic() {
        assert_eq!(sobol_table(), sobol_table());
        assert_eq!(ranking_tile_table(), ranking_tile_table());
    }

    #[test]
    fn test_ranking_stays_in_sample_range() {
        for value in ranking_tile_table() {
            assert!(value < SAMPLE_COUNT);
        }
    }
}
