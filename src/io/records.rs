//! Binary record stream for wake and surface state
//!
//! # Record layout
//!
//! ```text
//! +----------------+
//! | Tag (4B)       |  "WKTV" trailing vortex, "WKGN" grid nodes, "WKGL" loop circulation
//! | Length (8B)    |  body size in bytes, little endian
//! +----------------+
//! | Body           |  little-endian u64 / f64 fields
//! +----------------+
//! ```
//!
//! The length prefix lets a reader skip a record with one seek, without
//! parsing its body. A record is parsed completely before anything is
//! written into the target object, so a failed read leaves it unchanged.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use crate::error::{WakeError, WakeResult};
use crate::mesh::grid::Grid;
use crate::simulation::states::{NVec3, VortexId};
use crate::simulation::trailing_vortex::TrailingVortex;

pub const VORTEX_TAG: [u8; 4] = *b"WKTV";
pub const GRID_NODE_TAG: [u8; 4] = *b"WKGN";
pub const GRID_LOOP_TAG: [u8; 4] = *b"WKGL";

/// Record header size: tag + body length
pub const HEADER_SIZE: usize = 4 + 8;

/// Largest buffer reserved up front for a record body; longer bodies grow
/// as the bytes arrive
const MAX_BODY_RESERVE: u64 = 1 << 20;

/// Record body being assembled in memory
#[derive(Debug, Default)]
pub struct RecordBody {
    buf: Vec<u8>,
}

impl RecordBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_usize(&mut self, v: usize) {
        self.put_u64(v as u64);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_vec3(&mut self, v: &NVec3) {
        self.put_f64(v.x);
        self.put_f64(v.y);
        self.put_f64(v.z);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write the record header and body
    pub fn write_to<W: Write>(&self, writer: &mut W, tag: [u8; 4]) -> WakeResult<()> {
        writer.write_all(&tag)?;
        writer.write_all(&(self.buf.len() as u64).to_le_bytes())?;
        writer.write_all(&self.buf)?;
        Ok(())
    }
}

/// Body of a record read back, consumed front to back
#[derive(Debug)]
pub struct RecordCursor {
    buf: Vec<u8>,
    pos: usize,
}

impl RecordCursor {
    /// Read the next record, which must carry `tag`
    pub fn read_from<R: Read>(reader: &mut R, tag: [u8; 4]) -> WakeResult<Self> {
        let (found, len) = read_header(reader)?;
        if found != tag {
            return Err(WakeError::RecordTag { expected: tag, found });
        }

        let mut buf = Vec::with_capacity(len.min(MAX_BODY_RESERVE) as usize);
        reader.by_ref().take(len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(WakeError::RecordLength { tag, declared: len, available: buf.len() as u64 });
        }
        Ok(Self { buf, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> WakeResult<[u8; N]> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "record body truncated").into());
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub fn get_u64(&mut self) -> WakeResult<u64> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }

    pub fn get_usize(&mut self) -> WakeResult<usize> {
        Ok(self.get_u64()? as usize)
    }

    pub fn get_f64(&mut self) -> WakeResult<f64> {
        Ok(f64::from_le_bytes(self.take::<8>()?))
    }

    pub fn get_vec3(&mut self) -> WakeResult<NVec3> {
        Ok(NVec3::new(self.get_f64()?, self.get_f64()?, self.get_f64()?))
    }

    /// Read a count and check it against what the target object holds
    pub fn expect_count(&mut self, what: &'static str, expected: usize) -> WakeResult<()> {
        let found = self.get_usize()?;
        if found != expected {
            return Err(WakeError::RecordMismatch { what, expected, found });
        }
        Ok(())
    }
}

/// Skip the next record, which must carry `tag`, without parsing its body
pub fn skip_record<R: Read + Seek>(reader: &mut R, tag: [u8; 4]) -> WakeResult<()> {
    let (found, len) = read_header(reader)?;
    if found != tag {
        return Err(WakeError::RecordTag { expected: tag, found });
    }
    let here = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    let available = end.saturating_sub(here);
    if len > available {
        reader.seek(SeekFrom::Start(here))?;
        return Err(WakeError::RecordLength { tag, declared: len, available });
    }
    reader.seek(SeekFrom::Start(here + len))?;
    Ok(())
}

fn read_header<R: Read>(reader: &mut R) -> WakeResult<([u8; 4], u64)> {
    let mut tag = [0u8; 4];
    reader.read_exact(&mut tag)?;
    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    Ok((tag, u64::from_le_bytes(len)))
}

// =========================================================================================
// Trailing vortex
// =========================================================================================

impl TrailingVortex {
    /// Write one filament record: identity, scalar state, fine nodes,
    /// circulation history and wake age. Coarse levels are not written, they
    /// are rebuilt on read.
    pub fn write_to_file<W: Write>(&self, writer: &mut W) -> WakeResult<()> {
        let mut body = RecordBody::new();

        body.put_usize(self.id.wing);
        body.put_usize(self.id.edge);
        body.put_usize(self.id.node);
        body.put_usize(self.id.component);

        body.put_usize(self.number_of_sub_vortices());
        body.put_f64(self.far_dist);
        body.put_usize(self.current_time_step);
        body.put_f64(self.s_over_b);
        body.put_f64(self.params.core_size);
        body.put_f64(self.params.sigma);
        body.put_f64(self.params.wake_relax);
        body.put_vec3(&self.free_stream);
        body.put_vec3(&self.te_node.xyz);
        body.put_vec3(&self.infinity_node);
        body.put_vec3(&self.infinity_dir);

        for i in 0..self.nodes.len() {
            body.put_f64(self.s[i]);
            body.put_vec3(&self.nodes[i].xyz);
        }
        for i in 0..self.gamma.len() {
            body.put_f64(self.gamma[i]);
            body.put_f64(self.wake_age[i]);
        }

        body.write_to(writer, VORTEX_TAG)
    }

    /// Read a filament record into a vortex already set up with the same
    /// number of sub-vortices. The analysis mode is kept. On error the
    /// vortex is left as it was.
    pub fn read_in_file<R: Read>(&mut self, reader: &mut R) -> WakeResult<()> {
        assert!(self.is_set_up(), "trailing vortex read before setup");
        let mut rec = RecordCursor::read_from(reader, VORTEX_TAG)?;

        let id = VortexId {
            wing: rec.get_usize()?,
            edge: rec.get_usize()?,
            node: rec.get_usize()?,
            component: rec.get_usize()?,
        };

        rec.expect_count("sub-vortices", self.number_of_sub_vortices())?;
        let far_dist = rec.get_f64()?;
        let current_time_step = rec.get_usize()?;
        let s_over_b = rec.get_f64()?;
        let core_size = rec.get_f64()?;
        let sigma = rec.get_f64()?;
        let wake_relax = rec.get_f64()?;
        let free_stream = rec.get_vec3()?;
        let te = rec.get_vec3()?;
        let infinity_node = rec.get_vec3()?;
        let infinity_dir = rec.get_vec3()?;

        let mut stations = Vec::with_capacity(self.nodes.len());
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for _ in 0..self.nodes.len() {
            stations.push(rec.get_f64()?);
            nodes.push(rec.get_vec3()?);
        }
        let mut gamma = Vec::with_capacity(self.gamma.len());
        let mut wake_age = Vec::with_capacity(self.gamma.len());
        for _ in 0..self.gamma.len() {
            gamma.push(rec.get_f64()?);
            wake_age.push(rec.get_f64()?);
        }

        // whole record parsed, commit
        self.id = id;
        self.far_dist = far_dist;
        self.current_time_step = current_time_step;
        self.s_over_b = s_over_b;
        self.params.core_size = core_size;
        self.params.sigma = sigma;
        self.params.wake_relax = wake_relax;
        self.set_free_stream(free_stream);
        self.te_node.xyz = te;
        self.infinity_node = infinity_node;
        self.infinity_dir = infinity_dir;
        self.s = stations;
        for (node, xyz) in self.nodes.iter_mut().zip(nodes) {
            node.xyz = xyz;
        }
        self.gamma = gamma;
        self.wake_age = wake_age;

        self.rebuild_levels(true);
        Ok(())
    }

    /// Step over one filament record
    pub fn skip_read_in_file<R: Read + Seek>(reader: &mut R) -> WakeResult<()> {
        skip_record(reader, VORTEX_TAG)
    }
}

// =========================================================================================
// Grid
// =========================================================================================

impl Grid<'_> {
    /// Write node positions and loop circulations as two records
    pub fn write_to_file<W: Write>(&self, writer: &mut W) -> WakeResult<()> {
        let mut nodes = RecordBody::new();
        nodes.put_usize(self.number_of_nodes());
        for node in self.nodes() {
            nodes.put_vec3(&node.xyz);
        }
        nodes.write_to(writer, GRID_NODE_TAG)?;

        let mut loops = RecordBody::new();
        loops.put_usize(self.number_of_loops());
        for lp in self.loops() {
            loops.put_f64(lp.gamma);
        }
        loops.write_to(writer, GRID_LOOP_TAG)
    }

    /// Read node positions and loop circulations into a grid with the same
    /// topology, then refresh the derived loop geometry and edge circulation.
    /// On error the grid is left as it was.
    pub fn read_in_file<R: Read>(&mut self, reader: &mut R) -> WakeResult<()> {
        let mut rec = RecordCursor::read_from(reader, GRID_NODE_TAG)?;
        rec.expect_count("grid nodes", self.number_of_nodes())?;
        let xyz = (0..self.number_of_nodes()).map(|_| rec.get_vec3()).collect::<WakeResult<Vec<_>>>()?;

        let mut rec = RecordCursor::read_from(reader, GRID_LOOP_TAG)?;
        rec.expect_count("grid loops", self.number_of_loops())?;
        let gamma = (0..self.number_of_loops()).map(|_| rec.get_f64()).collect::<WakeResult<Vec<_>>>()?;

        for (node, x) in self.nodes_mut().iter_mut().zip(xyz) {
            node.xyz = x;
        }
        for (lp, g) in self.loops_mut().iter_mut().zip(gamma) {
            lp.gamma = g;
        }

        self.calculate_tri_normals_and_centroids();
        self.update_kutta_node_locations();
        self.update_edge_circulation();
        Ok(())
    }

    /// Step over the node and loop records
    pub fn skip_read_in_file<R: Read + Seek>(reader: &mut R) -> WakeResult<()> {
        skip_record(reader, GRID_NODE_TAG)?;
        skip_record(reader, GRID_LOOP_TAG)
    }
}
