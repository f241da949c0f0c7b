//! Feature record: id, layer, min/max zoom, metadata pairs, geometry.

pub mod metadata;

use integer_encoding::VarInt;

use crate::config::MAX_ZOOM_SENTINEL;
use crate::fixed::{codec as geom_codec, bounding_box, FixedBox, FixedGeometry};

pub use metadata::{MetaPair, MetaValue};

/// Capability a metadata encoder must provide to compress a feature's
/// metadata pairs via the shared dictionary. Kept as a trait so `feature`
/// doesn't depend on `metadata_coder` directly.
pub trait MetaEncoder {
    fn encode(&self, pair: &MetaPair) -> Option<u64>;
}

/// Inverse of [`MetaEncoder`]: resolve a dictionary id back to its pair.
pub trait MetaDecoder {
    fn decode(&self, id: u64) -> anyhow::Result<MetaPair>;
}

/// Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: u64,
    pub layer: u32,
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub meta: Vec<MetaPair>,
    pub geometry: FixedGeometry,
}

impl Feature {
    pub fn new(
        id: u64,
        layer: u32,
        min_zoom: u32,
        max_zoom: u32,
        meta: Vec<MetaPair>,
        geometry: FixedGeometry,
    ) -> anyhow::Result<Self> {
        let f = Feature {
            id,
            layer,
            min_zoom,
            max_zoom,
            meta,
            geometry,
        };
        f.validate()?;
        Ok(f)
    }

    /// `(min_zoom, max_zoom)` satisfies `min_zoom <= max_zoom <= 31`, with
    /// `max_zoom == 0x7F` meaning "all".
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_zoom > 31 {
            anyhow::bail!("feature {}: min_zoom {} out of range", self.id, self.min_zoom);
        }
        if self.max_zoom != MAX_ZOOM_SENTINEL {
            if self.max_zoom > 31 {
                anyhow::bail!("feature {}: max_zoom {} out of range", self.id, self.max_zoom);
            }
            if self.min_zoom > self.max_zoom {
                anyhow::bail!(
                    "feature {}: min_zoom {} > max_zoom {}",
                    self.id,
                    self.min_zoom,
                    self.max_zoom
                );
            }
        }
        Ok(())
    }

    pub fn covers_zoom(&self, z: u32) -> bool {
        z >= self.min_zoom && (self.max_zoom == MAX_ZOOM_SENTINEL || z <= self.max_zoom)
    }

    pub fn bounding_box(&self) -> Option<FixedBox> {
        bounding_box(&self.geometry)
    }

    /// Serialize this feature. When `coder` is supplied, metadata pairs
    /// present in the shared dictionary are replaced with their compressed
    /// id ("optimal" mode); otherwise every pair is written inline ("quick"
    /// mode, used by the ingest flush path).
    pub fn serialize(&self, coder: Option<&dyn MetaEncoder>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.min_zoom as u8);
        buf.push(if self.max_zoom == MAX_ZOOM_SENTINEL {
            0x7F
        } else {
            self.max_zoom as u8
        });

        let bbox = self.bounding_box().unwrap_or(FixedBox::new(
            crate::fixed::FixedXy::new(0, 0),
            crate::fixed::FixedXy::new(0, 0),
        ));
        buf.extend_from_slice(&bbox.min.x.to_le_bytes());
        buf.extend_from_slice(&bbox.min.y.to_le_bytes());
        buf.extend_from_slice(&bbox.max.x.to_le_bytes());
        buf.extend_from_slice(&bbox.max.y.to_le_bytes());

        write_varint(&mut buf, self.id);
        write_varint(&mut buf, self.layer as u64);
        write_varint(&mut buf, self.meta.len() as u64);
        for pair in &self.meta {
            if let Some(coder) = coder {
                if let Some(id) = coder.encode(pair) {
                    buf.push(1);
                    write_varint(&mut buf, id);
                    continue;
                }
            }
            buf.push(0);
            write_varint(&mut buf, pair.key.len() as u64);
            buf.extend_from_slice(pair.key.as_bytes());
            write_varint(&mut buf, pair.value.len() as u64);
            buf.extend_from_slice(&pair.value);
        }

        buf.extend_from_slice(&geom_codec::serialize(&self.geometry));
        buf
    }

    /// Full deserialize, no hints.
    pub fn deserialize(data: &[u8], decoder: Option<&dyn MetaDecoder>) -> anyhow::Result<Feature> {
        Self::deserialize_hinted(data, None, None, decoder)?
            .ok_or_else(|| anyhow::anyhow!("feature: deserialize_hinted unexpectedly skipped with no hints"))
    }

    /// Deserialize with early-exit hints: skip full deserialization when a
    /// bounding-box or zoom-level hint already proves the feature is out of
    /// range. Returns `Ok(None)` when a hint proves this feature can't match —
    /// never a fatal error (only a truncated/malformed record is fatal).
    pub fn deserialize_hinted(
        data: &[u8],
        box_hint: Option<&FixedBox>,
        zoom_hint: Option<u32>,
        decoder: Option<&dyn MetaDecoder>,
    ) -> anyhow::Result<Option<Feature>> {
        if data.len() < 2 + 32 {
            anyhow::bail!("feature: truncated header");
        }
        let min_zoom = data[0] as u32;
        let max_zoom_raw = data[1] as u32;
        let max_zoom = if max_zoom_raw == 0x7F {
            MAX_ZOOM_SENTINEL
        } else {
            max_zoom_raw
        };

        if let Some(z) = zoom_hint {
            if z < min_zoom || (max_zoom != MAX_ZOOM_SENTINEL && z > max_zoom) {
                return Ok(None);
            }
        }

        let box_min_x = i64::from_le_bytes(data[2..10].try_into().unwrap());
        let box_min_y = i64::from_le_bytes(data[10..18].try_into().unwrap());
        let box_max_x = i64::from_le_bytes(data[18..26].try_into().unwrap());
        let box_max_y = i64::from_le_bytes(data[26..34].try_into().unwrap());

        if let Some(hint) = box_hint {
            let fbox = FixedBox::new(
                crate::fixed::FixedXy::new(box_min_x, box_min_y),
                crate::fixed::FixedXy::new(box_max_x, box_max_y),
            );
            if fbox.disjoint(hint) {
                return Ok(None);
            }
        }

        let mut pos = 34usize;
        let id = read_varint(data, &mut pos)?;
        let layer = read_varint(data, &mut pos)? as u32;
        let meta_count = read_varint(data, &mut pos)?;

        let mut meta = Vec::with_capacity(meta_count as usize);
        for _ in 0..meta_count {
            let kind = *data
                .get(pos)
                .ok_or_else(|| anyhow::anyhow!("feature: truncated metadata"))?;
            pos += 1;
            if kind == 1 {
                let dict_id = read_varint(data, &mut pos)?;
                let decoder = decoder
                    .ok_or_else(|| anyhow::anyhow!("feature: coded metadata with no decoder"))?;
                meta.push(decoder.decode(dict_id)?);
            } else {
                let key_len = read_varint(data, &mut pos)? as usize;
                let key = std::str::from_utf8(&data[pos..pos + key_len])
                    .map_err(|e| anyhow::anyhow!("feature: invalid utf8 key: {e}"))?
                    .to_owned();
                pos += key_len;
                let val_len = read_varint(data, &mut pos)? as usize;
                let value = data[pos..pos + val_len].to_vec();
                pos += val_len;
                meta.push(MetaPair { key, value });
            }
        }

        let geometry = geom_codec::deserialize(&data[pos..])?;

        Ok(Some(Feature {
            id,
            layer,
            min_zoom,
            max_zoom,
            meta,
            geometry,
        }))
    }
}

fn write_varint(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

fn read_varint(data: &[u8], pos: &mut usize) -> anyhow::Result<u64> {
    let (v, n) = u64::decode_var(&data[*pos..])
        .ok_or_else(|| anyhow::anyhow!("feature: truncated varint"))?;
    *pos += n;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedXy;

    fn sample_feature() -> Feature {
        Feature::new(
            42,
            1,
            0,
            MAX_ZOOM_SENTINEL,
            vec![
                MetaPair::new("highway", &MetaValue::String("primary".into())),
                MetaPair::new("oneway", &MetaValue::Bool(true)),
            ],
            FixedGeometry::Polyline(vec![vec![FixedXy::new(0, 0), FixedXy::new(100, 100)]]),
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_quick_mode() {
        let f = sample_feature();
        let bytes = f.serialize(None);
        let back = Feature::deserialize(&bytes, None).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn zoom_hint_skips_out_of_range() {
        let f = Feature::new(
            1,
            0,
            5,
            10,
            vec![],
            FixedGeometry::Polyline(vec![vec![FixedXy::new(0, 0), FixedXy::new(1, 1)]]),
        )
        .unwrap();
        let bytes = f.serialize(None);
        assert!(Feature::deserialize_hinted(&bytes, None, Some(20), None)
            .unwrap()
            .is_none());
        assert!(Feature::deserialize_hinted(&bytes, None, Some(7), None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn box_hint_skips_disjoint() {
        let f = sample_feature();
        let bytes = f.serialize(None);
        let far = FixedBox::new(FixedXy::new(10_000, 10_000), FixedXy::new(20_000, 20_000));
        assert!(Feature::deserialize_hinted(&bytes, Some(&far), None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalid_zoom_range_rejected() {
        let err = Feature::new(1, 0, 10, 5, vec![], FixedGeometry::Null);
        assert!(err.is_err());
    }
}
