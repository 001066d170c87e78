use crate::geometry::surfel::Surfel;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Binary record layouts for flat, headerless surfel files.
///
/// All values are little-endian and there is no padding between fields or records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordLayout {
    /// position (3 x f64), colour (3 x u8), radius (f64), normal (3 x f32) - 47 bytes.
    Surfel,

    /// position (3 x f64), colour (3 x u8) - 27 bytes.
    Point,

    /// [RecordLayout::Surfel] followed by the provenance value (f32) - 51 bytes.
    /// Used for the intermediate files of builds with provenance.
    Annotated,
}

impl RecordLayout {
    pub const fn record_size(self) -> usize {
        match self {
            RecordLayout::Surfel => 47,
            RecordLayout::Point => 27,
            RecordLayout::Annotated => 51,
        }
    }

    /// Whether records of this layout store radius and normal.
    pub const fn carries_attributes(self) -> bool {
        matches!(self, RecordLayout::Surfel | RecordLayout::Annotated)
    }

    pub fn encode(self, surfel: &Surfel, wr: &mut impl Write) -> std::io::Result<()> {
        let position = surfel.position();
        wr.write_f64::<LittleEndian>(position.x)?;
        wr.write_f64::<LittleEndian>(position.y)?;
        wr.write_f64::<LittleEndian>(position.z)?;
        wr.write_all(&surfel.color())?;
        if self.carries_attributes() {
            let normal = surfel.normal();
            wr.write_f64::<LittleEndian>(surfel.radius())?;
            wr.write_f32::<LittleEndian>(normal.x)?;
            wr.write_f32::<LittleEndian>(normal.y)?;
            wr.write_f32::<LittleEndian>(normal.z)?;
        }
        if self == RecordLayout::Annotated {
            wr.write_f32::<LittleEndian>(surfel.provenance())?;
        }
        Ok(())
    }

    pub fn decode(self, rd: &mut impl Read) -> std::io::Result<Surfel> {
        let x = rd.read_f64::<LittleEndian>()?;
        let y = rd.read_f64::<LittleEndian>()?;
        let z = rd.read_f64::<LittleEndian>()?;
        let mut color = [0_u8; 3];
        rd.read_exact(&mut color)?;
        let position = Point3::new(x, y, z);
        if !self.carries_attributes() {
            return Ok(Surfel::from_position(position, color));
        }
        let radius = rd.read_f64::<LittleEndian>()?;
        let nx = rd.read_f32::<LittleEndian>()?;
        let ny = rd.read_f32::<LittleEndian>()?;
        let nz = rd.read_f32::<LittleEndian>()?;
        let surfel = Surfel::new(position, color, radius.max(0.0), Vector3::new(nx, ny, nz));
        match self {
            RecordLayout::Annotated => Ok(surfel.with_provenance(rd.read_f32::<LittleEndian>()?)),
            _ => Ok(surfel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{point, vector};

    #[test]
    fn record_sizes() {
        let s = Surfel::new(point![1.5, -2.0, 1e9], [1, 2, 3], 0.25, vector![0.0, 1.0, 0.0]);
        for layout in [RecordLayout::Surfel, RecordLayout::Point, RecordLayout::Annotated] {
            let mut buf = Vec::new();
            layout.encode(&s, &mut buf).unwrap();
            assert_eq!(buf.len(), layout.record_size());
        }
    }

    #[test]
    fn field_order() {
        let s = Surfel::new(point![1.0, 2.0, 3.0], [7, 8, 9], 0.5, vector![0.0, 0.0, 1.0]);
        let mut buf = Vec::new();
        RecordLayout::Surfel.encode(&s, &mut buf).unwrap();
        assert_eq!(&buf[0..8], &1.0_f64.to_le_bytes());
        assert_eq!(&buf[16..24], &3.0_f64.to_le_bytes());
        assert_eq!(&buf[24..27], &[7, 8, 9]);
        assert_eq!(&buf[27..35], &0.5_f64.to_le_bytes());
        assert_eq!(&buf[43..47], &1.0_f32.to_le_bytes());
    }

    #[test]
    fn annotated_layout_keeps_provenance() {
        let s = Surfel::new(point![1.0, 2.0, 3.0], [7, 8, 9], 0.5, vector![0.0, 0.0, 1.0])
            .with_provenance(0.75);
        let mut buf = Vec::new();
        RecordLayout::Annotated.encode(&s, &mut buf).unwrap();
        assert_eq!(&buf[47..51], &0.75_f32.to_le_bytes());
        assert_eq!(RecordLayout::Annotated.decode(&mut buf.as_slice()).unwrap(), s);

        // the plain layout drops the value
        let decoded = RecordLayout::Surfel.decode(&mut &buf[..47]).unwrap();
        assert_eq!(decoded, s.with_provenance(0.0));
    }

    #[test]
    fn point_layout_drops_attributes() {
        let s = Surfel::new(point![1.0, 2.0, 3.0], [7, 8, 9], 0.5, vector![0.0, 0.0, 1.0]);
        let mut buf = Vec::new();
        RecordLayout::Point.encode(&s, &mut buf).unwrap();
        let decoded = RecordLayout::Point.decode(&mut buf.as_slice()).unwrap();
        assert_eq!(*decoded.position(), *s.position());
        assert_eq!(decoded.color(), s.color());
        assert_eq!(decoded.radius(), 0.0);
        assert!(!decoded.has_normal());
    }
}
