//! Static configuration: chunk-size classes, the two bin tables, and
//! the closed-form size-to-bin routing functions.  The tables are
//! data; everything that interprets them lives in the router.
use crate::fsa::Fsa;

pub const KB: u32 = 1024;
pub const MB: u32 = 1024 * KB;

/// A chunk-size class: chunks of `1 << shift` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    pub shift: u8,
    pub index: u8,
}

const C64K: ChunkConfig = ChunkConfig { shift: 16, index: 0 };
const C128K: ChunkConfig = ChunkConfig { shift: 17, index: 1 };
const C256K: ChunkConfig = ChunkConfig { shift: 18, index: 2 };
const C512K: ChunkConfig = ChunkConfig { shift: 19, index: 3 };
const C2M: ChunkConfig = ChunkConfig { shift: 21, index: 4 };
const C8M: ChunkConfig = ChunkConfig { shift: 23, index: 5 };
const C32M: ChunkConfig = ChunkConfig { shift: 25, index: 6 };
const C128M: ChunkConfig = ChunkConfig { shift: 27, index: 7 };
const C512M: ChunkConfig = ChunkConfig { shift: 29, index: 8 };

pub const CHUNK_CONFIGS: [ChunkConfig; 9] =
    [C64K, C128K, C256K, C512K, C2M, C8M, C32M, C128M, C512M];

/// Elements are addressed by 12-bit indices within their chunk.
pub const MAX_ELEMENTS_PER_CHUNK: u32 = 4096;

/// One size class: the exact slot size and the chunk class serving it.
#[derive(Clone, Copy, Debug)]
pub struct BinConfig {
    pub alloc_size: u32,
    pub chunk: ChunkConfig,
    /// Elements per chunk; chunk capacity clamped to the 12-bit
    /// element index space.
    pub max_alloc_count: u32,
}

// 25% waste target: four slot sizes per power-of-two band.
#[rustfmt::skip]
static RAW_25P: [(u32, ChunkConfig); 113] = [
    (16, C64K),                  (16, C64K),                  // 0, 1
    (16, C64K),                  (16, C64K),                  // 2, 3
    (16, C64K),                  (16, C64K),                  // 4, 5
    (16, C64K),                  (16, C64K),                  // 6, 7
    (16, C64K),                  (16, C64K),                  // 8, 9
    (16, C64K),                  (16, C64K),                  // 10, 11
    (16, C64K),                  (32, C64K),                  // 12, 13
    (32, C64K),                  (32, C64K),                  // 14, 15
    (32, C64K),                  (48, C64K),                  // 16, 17
    (48, C64K),                  (64, C64K),                  // 18, 19
    (64, C64K),                  (80, C64K),                  // 20, 21
    (96, C64K),                  (112, C64K),                 // 22, 23
    (128, C64K),                 (160, C64K),                 // 24, 25
    (192, C64K),                 (224, C64K),                 // 26, 27
    (256, C64K),                 (320, C64K),                 // 28, 29
    (384, C64K),                 (448, C64K),                 // 30, 31
    (512, C64K),                 (640, C64K),                 // 32, 33
    (768, C64K),                 (896, C64K),                 // 34, 35
    (1 * KB, C64K),              (1 * KB + 256, C64K),        // 36, 37
    (1 * KB + 512, C64K),        (1 * KB + 768, C64K),        // 38, 39
    (2 * KB, C64K),              (2 * KB + 512, C64K),        // 40, 41
    (3 * KB, C64K),              (3 * KB + 512, C64K),        // 42, 43
    (4 * KB, C64K),              (5 * KB, C128K),             // 44, 45
    (6 * KB, C128K),             (7 * KB, C128K),             // 46, 47
    (8 * KB, C64K),              (10 * KB, C128K),            // 48, 49
    (12 * KB, C128K),            (14 * KB, C128K),            // 50, 51
    (16 * KB, C64K),             (20 * KB, C128K),            // 52, 53
    (24 * KB, C128K),            (28 * KB, C128K),            // 54, 55
    (32 * KB, C64K),             (40 * KB, C512K),            // 56, 57
    (48 * KB, C512K),            (56 * KB, C512K),            // 58, 59
    (64 * KB, C512K),            (80 * KB, C512K),            // 60, 61
    (96 * KB, C512K),            (112 * KB, C512K),           // 62, 63
    (128 * KB, C512K),           (160 * KB, C2M),             // 64, 65
    (192 * KB, C2M),             (224 * KB, C2M),             // 66, 67
    (256 * KB, C2M),             (320 * KB, C2M),             // 68, 69
    (384 * KB, C2M),             (448 * KB, C2M),             // 70, 71
    (512 * KB, C2M),             (640 * KB, C8M),             // 72, 73
    (768 * KB, C8M),             (896 * KB, C8M),             // 74, 75
    (1 * MB, C8M),               (1 * MB + 256 * KB, C8M),    // 76, 77
    (1 * MB + 512 * KB, C8M),    (1 * MB + 768 * KB, C8M),    // 78, 79
    (2 * MB, C32M),              (2 * MB + 512 * KB, C32M),   // 80, 81
    (3 * MB, C32M),              (3 * MB + 512 * KB, C32M),   // 82, 83
    (4 * MB, C32M),              (5 * MB, C32M),              // 84, 85
    (6 * MB, C32M),              (7 * MB, C32M),              // 86, 87
    (8 * MB, C32M),              (10 * MB, C32M),             // 88, 89
    (12 * MB, C32M),             (14 * MB, C32M),             // 90, 91
    (16 * MB, C32M),             (20 * MB, C32M),             // 92, 93
    (24 * MB, C32M),             (28 * MB, C32M),             // 94, 95
    (32 * MB, C32M),             (40 * MB, C128M),            // 96, 97
    (48 * MB, C128M),            (56 * MB, C128M),            // 98, 99
    (64 * MB, C128M),            (80 * MB, C128M),            // 100, 101
    (96 * MB, C128M),            (112 * MB, C128M),           // 102, 103
    (128 * MB, C128M),           (160 * MB, C512M),           // 104, 105
    (192 * MB, C512M),           (224 * MB, C512M),           // 106, 107
    (256 * MB, C512M),           (320 * MB, C512M),           // 108, 109
    (384 * MB, C512M),           (448 * MB, C512M),           // 110, 111
    (512 * MB, C512M),                                        // 112
];

// 10% waste target: eight slot sizes per power-of-two band.
#[rustfmt::skip]
static RAW_10P: [(u32, ChunkConfig); 216] = [
    (8, C64K),                   (8, C64K),                   // 0, 1
    (8, C64K),                   (8, C64K),                   // 2, 3
    (8, C64K),                   (8, C64K),                   // 4, 5
    (8, C64K),                   (8, C64K),                   // 6, 7
    (8, C64K),                   (16, C64K),                  // 8, 9
    (16, C64K),                  (16, C64K),                  // 10, 11
    (16, C64K),                  (16, C64K),                  // 12, 13
    (16, C64K),                  (16, C64K),                  // 14, 15
    (16, C64K),                  (24, C64K),                  // 16, 17
    (24, C64K),                  (24, C64K),                  // 18, 19
    (24, C64K),                  (28, C64K),                  // 20, 21
    (32, C64K),                  (32, C64K),                  // 22, 23
    (32, C64K),                  (40, C64K),                  // 24, 25
    (40, C64K),                  (48, C64K),                  // 26, 27
    (48, C64K),                  (56, C64K),                  // 28, 29
    (56, C64K),                  (64, C64K),                  // 30, 31
    (64, C64K),                  (80, C64K),                  // 32, 33
    (80, C64K),                  (88, C64K),                  // 34, 35
    (96, C64K),                  (112, C64K),                 // 36, 37
    (112, C64K),                 (128, C64K),                 // 38, 39
    (128, C64K),                 (160, C64K),                 // 40, 41
    (160, C64K),                 (192, C64K),                 // 42, 43
    (192, C64K),                 (224, C64K),                 // 44, 45
    (224, C64K),                 (256, C64K),                 // 46, 47
    (256, C64K),                 (288, C64K),                 // 48, 49
    (320, C64K),                 (352, C64K),                 // 50, 51
    (384, C64K),                 (448, C64K),                 // 52, 53
    (448, C64K),                 (512, C64K),                 // 54, 55
    (512, C64K),                 (640, C64K),                 // 56, 57
    (640, C64K),                 (768, C64K),                 // 58, 59
    (768, C64K),                 (896, C64K),                 // 60, 61
    (896, C64K),                 (960, C64K),                 // 62, 63
    (1 * KB, C64K),              (1 * KB + 128, C64K),        // 64, 65
    (1 * KB + 256, C128K),       (1 * KB + 384, C128K),       // 66, 67
    (1 * KB + 512, C128K),       (1 * KB + 640, C128K),       // 68, 69
    (1 * KB + 768, C128K),       (1 * KB + 896, C128K),       // 70, 71
    (2 * KB, C128K),             (2 * KB + 256, C128K),       // 72, 73
    (2 * KB + 512, C128K),       (2 * KB + 768, C128K),       // 74, 75
    (3 * KB, C128K),             (3 * KB + 256, C128K),       // 76, 77
    (3 * KB + 512, C128K),       (3 * KB + 768, C128K),       // 78, 79
    (4 * KB, C128K),             (4 * KB + 512, C128K),       // 80, 81
    (5 * KB, C128K),             (5 * KB + 512, C128K),       // 82, 83
    (6 * KB, C128K),             (6 * KB + 512, C128K),       // 84, 85
    (7 * KB, C128K),             (7 * KB + 512, C128K),       // 86, 87
    (8 * KB, C128K),             (9 * KB, C128K),             // 88, 89
    (10 * KB, C128K),            (11 * KB, C128K),            // 90, 91
    (12 * KB, C128K),            (13 * KB, C128K),            // 92, 93
    (14 * KB, C128K),            (15 * KB, C128K),            // 94, 95
    (16 * KB, C128K),            (18 * KB, C128K),            // 96, 97
    (20 * KB, C128K),            (22 * KB, C128K),            // 98, 99
    (24 * KB, C128K),            (26 * KB, C128K),            // 100, 101
    (28 * KB, C128K),            (30 * KB, C128K),            // 102, 103
    (32 * KB, C128K),            (36 * KB, C512K),            // 104, 105
    (40 * KB, C512K),            (44 * KB, C512K),            // 106, 107
    (48 * KB, C512K),            (52 * KB, C512K),            // 108, 109
    (56 * KB, C512K),            (60 * KB, C512K),            // 110, 111
    (64 * KB, C512K),            (72 * KB, C512K),            // 112, 113
    (80 * KB, C512K),            (88 * KB, C512K),            // 114, 115
    (96 * KB, C512K),            (104 * KB, C512K),           // 116, 117
    (112 * KB, C512K),           (120 * KB, C512K),           // 118, 119
    (128 * KB, C512K),           (144 * KB, C512K),           // 120, 121
    (160 * KB, C2M),             (176 * KB, C2M),             // 122, 123
    (192 * KB, C2M),             (208 * KB, C2M),             // 124, 125
    (224 * KB, C2M),             (240 * KB, C2M),             // 126, 127
    (256 * KB, C2M),             (288 * KB, C2M),             // 128, 129
    (320 * KB, C2M),             (352 * KB, C2M),             // 130, 131
    (384 * KB, C2M),             (416 * KB, C2M),             // 132, 133
    (448 * KB, C2M),             (480 * KB, C2M),             // 134, 135
    (512 * KB, C2M),             (576 * KB, C8M),             // 136, 137
    (640 * KB, C8M),             (704 * KB, C8M),             // 138, 139
    (768 * KB, C8M),             (832 * KB, C8M),             // 140, 141
    (896 * KB, C8M),             (960 * KB, C8M),             // 142, 143
    (1 * MB, C8M),               (1 * MB + 128 * KB, C8M),    // 144, 145
    (1 * MB + 256 * KB, C8M),    (1 * MB + 384 * KB, C8M),    // 146, 147
    (1 * MB + 512 * KB, C8M),    (1 * MB + 640 * KB, C8M),    // 148, 149
    (1 * MB + 768 * KB, C8M),    (1 * MB + 896 * KB, C8M),    // 150, 151
    (2 * MB, C32M),              (2 * MB + 256 * KB, C32M),   // 152, 153
    (2 * MB + 512 * KB, C32M),   (2 * MB + 768 * KB, C32M),   // 154, 155
    (3 * MB, C32M),              (3 * MB + 256 * KB, C32M),   // 156, 157
    (3 * MB + 512 * KB, C32M),   (3 * MB + 768 * KB, C32M),   // 158, 159
    (4 * MB, C32M),              (4 * MB + 512 * KB, C32M),   // 160, 161
    (5 * MB, C32M),              (5 * MB + 512 * KB, C32M),   // 162, 163
    (6 * MB, C32M),              (6 * MB + 512 * KB, C32M),   // 164, 165
    (7 * MB, C32M),              (7 * MB + 512 * KB, C32M),   // 166, 167
    (8 * MB, C32M),              (9 * MB, C32M),              // 168, 169
    (10 * MB, C32M),             (11 * MB, C32M),             // 170, 171
    (12 * MB, C32M),             (13 * MB, C32M),             // 172, 173
    (14 * MB, C32M),             (15 * MB, C32M),             // 174, 175
    (16 * MB, C32M),             (18 * MB, C32M),             // 176, 177
    (20 * MB, C32M),             (22 * MB, C32M),             // 178, 179
    (24 * MB, C32M),             (26 * MB, C32M),             // 180, 181
    (28 * MB, C32M),             (30 * MB, C32M),             // 182, 183
    (32 * MB, C32M),             (36 * MB, C128M),            // 184, 185
    (40 * MB, C128M),            (44 * MB, C128M),            // 186, 187
    (48 * MB, C128M),            (52 * MB, C128M),            // 188, 189
    (56 * MB, C128M),            (60 * MB, C128M),            // 190, 191
    (64 * MB, C128M),            (72 * MB, C128M),            // 192, 193
    (80 * MB, C128M),            (88 * MB, C128M),            // 194, 195
    (96 * MB, C128M),            (104 * MB, C128M),           // 196, 197
    (112 * MB, C128M),           (120 * MB, C128M),           // 198, 199
    (128 * MB, C128M),           (144 * MB, C512M),           // 200, 201
    (160 * MB, C512M),           (176 * MB, C512M),           // 202, 203
    (192 * MB, C512M),           (208 * MB, C512M),           // 204, 205
    (224 * MB, C512M),           (240 * MB, C512M),           // 206, 207
    (256 * MB, C512M),           (288 * MB, C512M),           // 208, 209
    (320 * MB, C512M),           (352 * MB, C512M),           // 210, 211
    (384 * MB, C512M),           (416 * MB, C512M),           // 212, 213
    (448 * MB, C512M),           (480 * MB, C512M),           // 214, 215
];

fn build_bins(raw: &[(u32, ChunkConfig)]) -> Vec<BinConfig> {
    raw.iter()
        .map(|&(alloc_size, chunk)| BinConfig {
            alloc_size,
            chunk,
            max_alloc_count: ((1u32 << chunk.shift) / alloc_size).min(MAX_ELEMENTS_PER_CHUNK),
        })
        .collect()
}

lazy_static::lazy_static! {
    static ref BINS_25P: Vec<BinConfig> = build_bins(&RAW_25P);
    static ref BINS_10P: Vec<BinConfig> = build_bins(&RAW_10P);
}

/// The slot-size rounding policy.  Both policies share the allocator
/// machinery and differ only in their bin table and routing function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizePolicy {
    /// Eight steps per power-of-two band, ~10% worst-case waste.
    TenPercent,
    /// Four steps per power-of-two band, ~25% worst-case waste.
    TwentyFivePercent,
}

impl SizePolicy {
    pub fn bins(self) -> &'static [BinConfig] {
        match self {
            SizePolicy::TenPercent => &BINS_10P,
            SizePolicy::TwentyFivePercent => &BINS_25P,
        }
    }

    /// Maps a request size to its bin index: the request is rounded
    /// up to the next step of the band containing it, and the step
    /// count indexes the table directly.  Returns `None` when the
    /// request exceeds the largest configured bin.
    pub fn bin_index(self, size: usize) -> Option<usize> {
        if size > u32::MAX as usize {
            return None;
        }

        let (min_size, step_bits) = match self {
            SizePolicy::TenPercent => (8u32, 3u32),
            SizePolicy::TwentyFivePercent => (4u32, 2u32),
        };

        let size = (size as u32).max(min_size);
        let w = size.leading_zeros();
        let band = 0x8000_0000u32 >> w;
        let step = (band - 1) >> step_bits;
        let rounded = size.checked_add(step)? & !step;
        let shift = 31 - step_bits - w;
        let bin = ((rounded >> shift) as usize) + ((shift as usize) << step_bits);

        if bin < self.bins().len() {
            debug_assert!(size <= self.bins()[bin].alloc_size);
            Some(bin)
        } else {
            None
        }
    }

    /// The largest size `allocate` can serve under this policy.
    pub fn max_alloc_size(self) -> usize {
        self.bins().last().expect("tables are non-empty").alloc_size as usize
    }
}

/// Reservation sizes and policy knobs for one allocator instance.
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub policy: SizePolicy,
    /// Payload reservation; a power-of-two multiple of the segment
    /// size.
    pub space_range: usize,
    /// log2 of the segment size.  Must cover the largest chunk shift.
    pub segment_shift: u32,
    /// Bump-heap reservation and its eager commit.
    pub heap_range: usize,
    pub heap_pre_commit: usize,
    /// FSA reservation and section granularity.
    pub fsa_range: usize,
    pub fsa_section_size: usize,
    /// Empty chunks retained committed per segment; 0 decommits
    /// eagerly.
    pub chunk_cache_watermark: u32,
    /// Mapper registered under this name serves all reservations;
    /// `None` selects the default anonymous mapper.
    pub mapper_name: Option<String>,
}

#[cfg(not(feature = "test_only_small_constants"))]
impl Default for AllocatorConfig {
    fn default() -> AllocatorConfig {
        AllocatorConfig {
            policy: SizePolicy::TwentyFivePercent,
            space_range: 256 << 30,
            segment_shift: 30,
            heap_range: 32 << 20,
            heap_pre_commit: 4 << 20,
            fsa_range: 256 << 20,
            fsa_section_size: 8 << 20,
            chunk_cache_watermark: 0,
            mapper_name: None,
        }
    }
}

#[cfg(feature = "test_only_small_constants")]
impl Default for AllocatorConfig {
    fn default() -> AllocatorConfig {
        AllocatorConfig {
            policy: SizePolicy::TwentyFivePercent,
            space_range: 16 << 30,
            segment_shift: 30,
            heap_range: 16 << 20,
            heap_pre_commit: 1 << 20,
            fsa_range: 64 << 20,
            fsa_section_size: 4 << 20,
            chunk_cache_watermark: 0,
            mapper_name: None,
        }
    }
}

impl AllocatorConfig {
    /// Sanity checks a configuration; fatal on inconsistent tables.
    pub(crate) fn verify(&self) {
        let max_chunk_shift = CHUNK_CONFIGS.iter().map(|c| c.shift).max().unwrap() as u32;
        assert!(self.segment_shift >= max_chunk_shift);
        assert!(self.space_range.is_power_of_two());
        assert!(self.space_range >> self.segment_shift >= 1);
        assert!(self.fsa_section_size.is_power_of_two());

        for bin in self.policy.bins().iter() {
            assert!(bin.max_alloc_count >= 1);
            assert!(bin.max_alloc_count <= MAX_ELEMENTS_PER_CHUNK);
            // The binmap arrays for a full chunk must fit FSA items.
            assert!(crate::binmap::Binmap::level_words(bin.max_alloc_count)
                .iter()
                .all(|&w| (w as usize) * 4 <= Fsa::MAX_ITEM_SIZE));

            // Routing a bin's own size must land on a slot at least
            // that big.  Not necessarily the same entry: a few table
            // slots sit above their grid step, and their size then
            // routes one entry further.
            let routed = self
                .policy
                .bin_index(bin.alloc_size as usize)
                .expect("table sizes are routable");
            assert!(self.policy.bins()[routed].alloc_size >= bin.alloc_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_config_verifies() {
        AllocatorConfig::default().verify();
        AllocatorConfig {
            policy: SizePolicy::TenPercent,
            ..AllocatorConfig::default()
        }
        .verify();
    }

    #[test]
    fn known_routings_25p() {
        let policy = SizePolicy::TwentyFivePercent;
        let bins = policy.bins();

        // The canonical small request: 10 bytes rides in a 16-byte
        // slot of a 64 KiB chunk.
        let bin = bins[policy.bin_index(10).unwrap()];
        assert_eq!(bin.alloc_size, 16);
        assert_eq!(bin.chunk.shift, 16);
        assert_eq!(bin.max_alloc_count, 4096);

        assert_eq!(bins[policy.bin_index(16).unwrap()].alloc_size, 16);
        assert_eq!(bins[policy.bin_index(17).unwrap()].alloc_size, 32);
        assert_eq!(bins[policy.bin_index(48).unwrap()].alloc_size, 48);
        assert_eq!(bins[policy.bin_index(49).unwrap()].alloc_size, 64);
        assert_eq!(bins[policy.bin_index(1000).unwrap()].alloc_size, 1024);

        // A 32 MiB request occupies a whole 32 MiB chunk.
        let bin = bins[policy.bin_index(32 << 20).unwrap()];
        assert_eq!(bin.alloc_size, 32 * MB);
        assert_eq!(bin.chunk.shift, 25);
        assert_eq!(bin.max_alloc_count, 1);

        assert_eq!(policy.max_alloc_size(), (512 * MB) as usize);
        assert!(policy.bin_index((512 << 20) + 1).is_none());
    }

    #[test]
    fn known_routings_10p() {
        let policy = SizePolicy::TenPercent;
        let bins = policy.bins();

        assert_eq!(bins[policy.bin_index(1).unwrap()].alloc_size, 8);
        assert_eq!(bins[policy.bin_index(8).unwrap()].alloc_size, 8);
        assert_eq!(bins[policy.bin_index(9).unwrap()].alloc_size, 16);
        assert_eq!(bins[policy.bin_index(17).unwrap()].alloc_size, 24);
        assert_eq!(bins[policy.bin_index(1000).unwrap()].alloc_size, 1024);

        // The 8-byte bins hit the element-count clamp.
        assert_eq!(bins[policy.bin_index(8).unwrap()].max_alloc_count, 4096);

        assert_eq!(policy.max_alloc_size(), (480 * MB) as usize);
        assert!(policy.bin_index((480 << 20) + 1).is_none());
    }

    fn check_fit(policy: SizePolicy, size: usize) -> usize {
        let bins = policy.bins();
        let bin = policy.bin_index(size).expect("size is in range");
        let slot = bins[bin].alloc_size as usize;

        // The slot fits the request, within a sane waste bound.
        assert!(size <= slot, "size {}", size);
        assert!(slot <= 2 * size.max(16), "size {} slot {}", size, slot);
        slot
    }

    #[test]
    fn exhaustive_small_sizes() {
        for policy in [SizePolicy::TwentyFivePercent, SizePolicy::TenPercent] {
            let mut prev_slot = 0;
            for size in 1..=(64usize << 10) {
                let slot = check_fit(policy, size);

                // Slot sizes are monotone in the request size.
                assert!(slot >= prev_slot, "size {} slot {}", size, slot);
                prev_slot = slot;
            }
        }
    }

    proptest! {
        #[test]
        fn large_sizes_route_and_fit(size in 1usize..=(480 << 20)) {
            check_fit(SizePolicy::TwentyFivePercent, size);
            check_fit(SizePolicy::TenPercent, size);
        }
    }
}
