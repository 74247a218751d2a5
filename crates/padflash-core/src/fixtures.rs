//! Synthetic catalog shared by unit tests

use crate::catalog::{Catalog, CatalogManifest};
use crate::model::Model;
use crate::palette::{Palette, Rgb};

pub const IMAGE_LEN: usize = 512;

pub const MANIFEST: &str = r#"
[[model]]
name = "LPX"
image = "lpx.bin"
signature = { offset = 0, len = 18 }
sysex_header = [0x00, 0x20, 0x29, 0x02, 0x0C]
palette = { offset = 128, slots = 128 }

[[model.patch]]
option = "ApolloFastLed"
offset = 32
bytes = [0x46, 0x41, 0x53, 0x54]

[[model]]
name = "LPPRO"
image = "lppro.bin"
signature = { offset = 0, len = 18 }
sysex_header = [0x00, 0x20, 0x29, 0x00, 0x51]
checksum = { kind = "sum16le", start = 18, end = 500, offset = 508 }

[[model]]
name = "LPMK2"
image = "lpmk2.bin"
signature = { offset = 0, len = 18 }
sysex_header = [0x00, 0x20, 0x29, 0x00, 0x69]
palette = { offset = 128, slots = 64, stride = 3 }
length_field = { offset = 504, width = 4 }
checksum = { kind = "sum8", start = 18, end = 500, offset = 510 }

[[model.patch]]
option = "ApolloFastLed"
offset = 400
bytes = [0x4C, 0x45, 0x44]

[[model]]
name = "CFY"
image = "cfy.bin"
signature = { offset = 0, len = 18 }
sysex_header = [0x00, 0x20, 0x29, 0x00, 0x51]
palette = { offset = 64, slots = 32 }
palette_required = true

[[model]]
name = "MF64"
image = "mf64.bin"
signature = { offset = 0, len = 18 }
palette = { offset = 64, slots = 64 }

[[model.patch]]
option = "NovationIdSpoof"
offset = 300
bytes = [0x12, 0x34]
"#;

/// Deterministic base image whose first 18 bytes identify the model
pub fn base_image(model: Model) -> Vec<u8> {
    let mut image: Vec<u8> = (0..IMAGE_LEN)
        .map(|i| ((i * 37 + 11) % 251) as u8)
        .collect();
    let signature = format!("PADFLASH-{:<9}", model.name());
    image[..18].copy_from_slice(signature.as_bytes());
    image
}

pub fn catalog() -> Catalog {
    let manifest = CatalogManifest::from_toml(MANIFEST).expect("fixture manifest");
    Catalog::from_manifest(&manifest, |table| {
        Ok(base_image(table.name.parse().expect("fixture model")))
    })
    .expect("fixture catalog")
}

/// A palette with distinct colors per slot
pub fn test_palette(len: usize) -> Palette {
    Palette::new(
        (0..len)
            .map(|i| Rgb::new((i % 64) as u8, (i * 3 % 64) as u8, (63 - i % 64) as u8))
            .collect(),
    )
}
