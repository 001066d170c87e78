use crate::geometry::surfel::Surfel;
use crate::io::{FormatError, PointFormat, PullFn};
use nalgebra::{Point3, Vector3};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// Whitespace separated text formats, one point per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiFormat {
    /// `x y z [r g b]`
    Xyz,

    /// `x y z r g b nx ny nz radius`
    XyzAll,

    /// `x y z intensity`
    XyzGrey,
}

impl AsciiFormat {
    fn parse_line(self, line: &str) -> Result<Surfel, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let expected: &[usize] = match self {
            AsciiFormat::Xyz => &[3, 6],
            AsciiFormat::XyzAll => &[10],
            AsciiFormat::XyzGrey => &[4],
        };
        if !expected.contains(&fields.len()) {
            return Err(format!(
                "expected {} values, found {}",
                expected
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(" or "),
                fields.len()
            ));
        }

        let position = Point3::new(
            parse::<f64>(fields[0])?,
            parse::<f64>(fields[1])?,
            parse::<f64>(fields[2])?,
        );
        let surfel = match self {
            AsciiFormat::Xyz if fields.len() == 3 => Surfel::from_position(position, [255; 3]),
            AsciiFormat::Xyz => Surfel::from_position(
                position,
                [
                    parse_channel(fields[3])?,
                    parse_channel(fields[4])?,
                    parse_channel(fields[5])?,
                ],
            ),
            AsciiFormat::XyzGrey => {
                let grey = parse_channel(fields[3])?;
                Surfel::from_position(position, [grey; 3])
            }
            AsciiFormat::XyzAll => {
                let radius = parse::<f64>(fields[9])?;
                if radius < 0.0 {
                    return Err(format!("negative radius {radius}"));
                }
                Surfel::new(
                    position,
                    [
                        parse_channel(fields[3])?,
                        parse_channel(fields[4])?,
                        parse_channel(fields[5])?,
                    ],
                    radius,
                    Vector3::new(
                        parse::<f32>(fields[6])?,
                        parse::<f32>(fields[7])?,
                        parse::<f32>(fields[8])?,
                    ),
                )
            }
        };
        Ok(surfel)
    }

    fn format_line(self, surfel: &Surfel, wr: &mut impl Write) -> std::io::Result<()> {
        let p = surfel.position();
        let [r, g, b] = surfel.color();
        match self {
            AsciiFormat::Xyz => writeln!(wr, "{} {} {} {r} {g} {b}", p.x, p.y, p.z),
            AsciiFormat::XyzGrey => {
                let grey = (r as u16 + g as u16 + b as u16) / 3;
                writeln!(wr, "{} {} {} {grey}", p.x, p.y, p.z)
            }
            AsciiFormat::XyzAll => {
                let n = surfel.normal();
                writeln!(
                    wr,
                    "{} {} {} {r} {g} {b} {} {} {} {}",
                    p.x,
                    p.y,
                    p.z,
                    n.x,
                    n.y,
                    n.z,
                    surfel.radius()
                )
            }
        }
    }
}

fn parse<T: FromStr>(field: &str) -> Result<T, String> {
    field
        .parse::<T>()
        .map_err(|_| format!("invalid number '{field}'"))
}

/// Colour channels are stored as integers in [0,255]. Decimal values are rounded.
fn parse_channel(field: &str) -> Result<u8, String> {
    let value = parse::<f64>(field)?;
    if !(0.0..=255.0).contains(&value) {
        return Err(format!("colour value '{field}' out of range"));
    }
    Ok(value.round() as u8)
}

impl PointFormat for AsciiFormat {
    fn extension(&self) -> &'static str {
        match self {
            AsciiFormat::Xyz => "xyz",
            AsciiFormat::XyzAll => "xyz_all",
            AsciiFormat::XyzGrey => "xyz_grey",
        }
    }

    fn carries_attributes(&self) -> bool {
        *self == AsciiFormat::XyzAll
    }

    fn read(&self, path: &Path, emit: &mut dyn FnMut(Surfel)) -> Result<u64, FormatError> {
        let file = File::open(path).map_err(|e| FormatError::io(path, e))?;
        let rd = BufReader::new(file);
        let mut count = 0;
        for (line_nr, line) in rd.lines().enumerate() {
            let line = line.map_err(|e| FormatError::io(path, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let surfel = self.parse_line(line).map_err(|message| FormatError::Parse {
                path: path.to_owned(),
                line: line_nr + 1,
                message,
            })?;
            emit(surfel);
            count += 1;
        }
        Ok(count)
    }

    fn write(&self, path: &Path, pull: &mut PullFn<'_>) -> Result<u64, FormatError> {
        let file = File::create(path).map_err(|e| FormatError::io(path, e))?;
        let mut wr = BufWriter::new(file);
        let mut count = 0;
        while let Some(batch) = pull()? {
            for surfel in &batch {
                self.format_line(surfel, &mut wr)
                    .map_err(|e| FormatError::io(path, e))?;
            }
            count += batch.len() as u64;
        }
        wr.flush().map_err(|e| FormatError::io(path, e))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::point;
    use tempfile::TempDir;

    fn read_to_vec(format: AsciiFormat, path: &Path) -> Result<Vec<Surfel>, FormatError> {
        let mut surfels = Vec::new();
        format.read(path, &mut |s| surfels.push(s))?;
        Ok(surfels)
    }

    #[test]
    fn parse_xyz() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.xyz");
        std::fs::write(&path, "# header\n1 2 3\n\n4.5 5 6 10 20 30\n").unwrap();
        let surfels = read_to_vec(AsciiFormat::Xyz, &path).unwrap();
        assert_eq!(surfels.len(), 2);
        assert_eq!(surfels[0].color(), [255, 255, 255]);
        assert_eq!(*surfels[1].position(), point![4.5, 5.0, 6.0]);
        assert_eq!(surfels[1].color(), [10, 20, 30]);
        assert!(!surfels[1].has_normal());
    }

    #[test]
    fn parse_grey_and_all() {
        let dir = TempDir::new().unwrap();
        let grey = dir.path().join("a.xyz_grey");
        std::fs::write(&grey, "0 0 0 128\n").unwrap();
        assert_eq!(
            read_to_vec(AsciiFormat::XyzGrey, &grey).unwrap()[0].color(),
            [128; 3]
        );

        let all = dir.path().join("a.xyz_all");
        std::fs::write(&all, "1 1 1 1 2 3 0 0 1 0.25\n").unwrap();
        let s = read_to_vec(AsciiFormat::XyzAll, &all).unwrap()[0];
        assert_eq!(s.radius(), 0.25);
        assert_eq!(s.normal().z, 1.0);
    }

    #[test]
    fn parse_error_reports_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.xyz");
        std::fs::write(&path, "1 2 3\n1 2 x\n").unwrap();
        match read_to_vec(AsciiFormat::Xyz, &path) {
            Err(FormatError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xyz_all");
        let surfels = vec![
            Surfel::new(point![0.5, 1.0, -2.0], [1, 2, 3], 0.125, Vector3::new(0.0, 1.0, 0.0)),
            Surfel::new(point![3.0, 4.0, 5.0], [4, 5, 6], 2.0, Vector3::new(1.0, 0.0, 0.0)),
        ];
        let mut batches = vec![surfels.clone()];
        let written = AsciiFormat::XyzAll
            .write(&path, &mut || Ok(batches.pop()))
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(read_to_vec(AsciiFormat::XyzAll, &path).unwrap(), surfels);
    }
}
