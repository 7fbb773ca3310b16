/*!
Parameter checkpoints.

A [`WeightsFile`] is little endian:

| field                 | type                     |
|-----------------------|--------------------------|
| magic                 | `b"CGWT"`                |
| version               | u32                      |
| precision             | u8, 0 FP32, 1 FP16       |
| iteration             | u32                      |
| layer count           | u32                      |
| per layer: index      | u32                      |
| per layer: kind       | u16 length, utf8         |
| per layer: parameters | u32                      |
| per parameter: name   | u16 length, utf8         |
| per parameter: len    | u64                      |
| per parameter: data   | f32 or f16 bits          |

Every layer is written, layers without parameters with a count of 0.
*/
use crate::{network::NetworkGraph, tensor::Precision, Error};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Cursor, Read, Write},
    path::Path,
};

const MAGIC: &[u8; 4] = b"CGWT";
const VERSION: u32 = 1;

/// Persists the parameters of a [`NetworkGraph`] with the iteration counter.
pub trait ParameterStore {
    /// Writes every parameter of `graph` and `iteration` to `path`.
    fn save(&self, path: &Path, iteration: u32, graph: &NetworkGraph) -> Result<()>;
    /// Restores the parameters of `graph` from `path`, returning the stored iteration.
    ///
    /// **Errors**
    ///
    /// [`Error::Checkpoint`] if the file cannot be decoded or does not match the graph. The graph
    /// is not modified.
    fn load(&self, path: &Path, graph: &mut NetworkGraph) -> Result<u32>;
}

/// The binary checkpoint format.
///
/// Parameters are stored in the precision of the graph, FP16 graphs lose the low bits of their
/// parameters on a round trip.
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightsFile;

struct StoredLayer {
    index: u32,
    kind: String,
    parameters: Vec<(String, Vec<f32>)>,
}

fn write_str(writer: &mut impl Write, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::checkpoint(format!("name {s:?} is too long")))?;
    writer.write_u16::<LittleEndian>(len)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str(reader: &mut impl Read) -> Result<String> {
    let len = reader.read_u16::<LittleEndian>()?;
    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::checkpoint("name is not utf8").into())
}

fn write_graph(writer: &mut impl Write, iteration: u32, graph: &NetworkGraph) -> Result<()> {
    let precision = graph.precision();
    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    writer.write_u8(match precision {
        Precision::Fp32 => 0,
        Precision::Fp16 => 1,
    })?;
    writer.write_u32::<LittleEndian>(iteration)?;
    writer.write_u32::<LittleEndian>(graph.layers().len() as u32)?;
    for layer in graph.layers() {
        let parameters = layer.parameters();
        writer.write_u32::<LittleEndian>(layer.index() as u32)?;
        write_str(writer, layer.kind())?;
        writer.write_u32::<LittleEndian>(parameters.len() as u32)?;
        for parameter in parameters {
            write_str(writer, parameter.name())?;
            writer.write_u64::<LittleEndian>(parameter.len() as u64)?;
            for x in parameter.value().iter().copied() {
                match precision {
                    Precision::Fp32 => writer.write_f32::<LittleEndian>(x)?,
                    Precision::Fp16 => {
                        writer.write_u16::<LittleEndian>(f16::from_f32(x).to_bits())?
                    }
                }
            }
        }
    }
    Ok(())
}

fn read_layers(reader: &mut impl Read) -> Result<(u32, Vec<StoredLayer>)> {
    let mut magic = [0; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::checkpoint("not a weights file").into());
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::checkpoint(format!("unsupported version {version}")).into());
    }
    let precision = match reader.read_u8()? {
        0 => Precision::Fp32,
        1 => Precision::Fp16,
        tag => return Err(Error::checkpoint(format!("unknown precision {tag}")).into()),
    };
    let iteration = reader.read_u32::<LittleEndian>()?;
    let layer_count = reader.read_u32::<LittleEndian>()?;
    let mut layers = Vec::new();
    for _ in 0..layer_count {
        let index = reader.read_u32::<LittleEndian>()?;
        let kind = read_str(reader)?;
        let parameter_count = reader.read_u32::<LittleEndian>()?;
        let mut parameters = Vec::new();
        for _ in 0..parameter_count {
            let name = read_str(reader)?;
            let len = reader.read_u64::<LittleEndian>()? as usize;
            let mut data = Vec::new();
            for _ in 0..len {
                data.push(match precision {
                    Precision::Fp32 => reader.read_f32::<LittleEndian>()?,
                    Precision::Fp16 => f16::from_bits(reader.read_u16::<LittleEndian>()?).to_f32(),
                });
            }
            parameters.push((name, data));
        }
        layers.push(StoredLayer {
            index,
            kind,
            parameters,
        });
    }
    Ok((iteration, layers))
}

fn check_layers(stored: &[StoredLayer], graph: &NetworkGraph) -> Result<()> {
    if stored.len() != graph.layers().len() {
        return Err(Error::checkpoint(format!(
            "checkpoint has {} layers, the network has {}",
            stored.len(),
            graph.layers().len()
        ))
        .into());
    }
    for (stored, layer) in stored.iter().zip(graph.layers()) {
        let parameters = layer.parameters();
        let matches = stored.index as usize == layer.index()
            && stored.kind == layer.kind()
            && stored.parameters.len() == parameters.len()
            && stored
                .parameters
                .iter()
                .zip(parameters.iter())
                .all(|((name, data), p)| name == p.name() && data.len() == p.len());
        if !matches {
            return Err(Error::checkpoint(format!(
                "layer {} ({}) does not match the stored {} layer {}",
                layer.index(),
                layer.kind(),
                stored.kind,
                stored.index
            ))
            .into());
        }
    }
    Ok(())
}

impl ParameterStore for WeightsFile {
    fn save(&self, path: &Path, iteration: u32, graph: &NetworkGraph) -> Result<()> {
        if let Some(dir) = path.parent().filter(|x| !x.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create checkpoint directory {dir:?}!"))?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            write_graph(&mut writer, iteration, graph)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        tracing::info!(?path, iteration, "saved checkpoint");
        Ok(())
    }
    fn load(&self, path: &Path, graph: &mut NetworkGraph) -> Result<u32> {
        let bytes = fs::read(path).with_context(|| format!("Failed to read checkpoint {path:?}!"))?;
        let (iteration, stored) = read_layers(&mut Cursor::new(bytes)).map_err(|e| {
            match e.downcast_ref::<io::Error>() {
                Some(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                    Error::checkpoint(format!("{path:?} is truncated")).into()
                }
                _ => e,
            }
        })?;
        check_layers(&stored, graph)?;
        for (i, stored) in stored.into_iter().enumerate() {
            let Some(layer) = graph.layer_mut(i) else {
                continue;
            };
            let parameters = layer.parameters_mut().into_iter().zip(stored.parameters);
            for (parameter, (_, data)) in parameters {
                parameter
                    .value_mut()
                    .iter_mut()
                    .zip(data)
                    .for_each(|(x, y)| *x = y);
            }
        }
        tracing::info!(?path, iteration, "loaded checkpoint");
        Ok(iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TrainConfig, network::NetworkDefinition};
    use krnl::device::Device;

    fn graph(json: &str, seed: u64) -> NetworkGraph {
        let definition = NetworkDefinition::from_json(json).unwrap();
        let config = TrainConfig {
            seed,
            ..TrainConfig::default()
        };
        NetworkGraph::load(&definition, &config, Device::host()).unwrap()
    }

    const NET: &str = r#"{
        "input": { "channels": 2, "width": 4, "height": 4 },
        "layers": [
            { "kind": "convolutional", "filters": 3, "size": 3, "pad": 1 },
            { "kind": "batchnorm" },
            { "kind": "activation", "activation": "prelu" }
        ]
    }"#;

    fn values(graph: &NetworkGraph) -> Vec<Vec<f32>> {
        graph
            .layers()
            .iter()
            .flat_map(|layer| layer.parameters())
            .map(|p| p.value().to_vec())
            .collect()
    }

    #[test]
    fn fp32_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("net.weights");
        let saved = graph(NET, 1);
        WeightsFile.save(&path, 100, &saved)?;
        let mut loaded = graph(NET, 2);
        assert_ne!(values(&saved), values(&loaded));
        assert_eq!(WeightsFile.load(&path, &mut loaded)?, 100);
        let saved = values(&saved);
        let loaded = values(&loaded);
        for (a, b) in saved.iter().flatten().zip(loaded.iter().flatten()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        Ok(())
    }

    #[test]
    fn mismatch_is_checkpoint_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("net.weights");
        WeightsFile.save(&path, 3, &graph(NET, 0))?;
        let other = NET.replace(r#""filters": 3"#, r#""filters": 4"#);
        let mut other = graph(&other, 0);
        let before = values(&other);
        let error = WeightsFile.load(&path, &mut other).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Checkpoint(_))));
        assert_eq!(values(&other), before);
        Ok(())
    }

    #[test]
    fn truncated_is_checkpoint_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("net.weights");
        WeightsFile.save(&path, 3, &graph(NET, 0))?;
        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() - 3])?;
        let error = WeightsFile.load(&path, &mut graph(NET, 0)).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Checkpoint(_))));
        fs::write(&path, b"nope")?;
        let error = WeightsFile.load(&path, &mut graph(NET, 0)).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Checkpoint(_))));
        Ok(())
    }
}
