//! Mesh preparation and LOD block encoding.
//!
//! The format stores exactly one normal and one UV per vertex, so corners
//! that disagree across a seam, a sharp edge or a flat face get their own
//! vertex. Faces end up as triangles or quads only.

use std::collections::{BTreeMap, BTreeSet};
use std::f32::consts::{PI, TAU};

use glam::{Vec2, Vec3};
use rootcause::Report;
use thiserror::Error;

use super::buffer::{PutLe, len_u32};
use super::{
    ATTR_TYPE_FLOAT2, ATTR_TYPE_FLOAT3, ATTR_TYPE_SKIN_WEIGHTS, BinaryBuffer, FormatError,
    TAG_ATTRIBUTE, TAG_LOD, animation::BoneLookup,
};
use crate::error::Diagnostics;
use crate::math::{Aabb, encode_octahedral};
use crate::scene::{Mesh, ObjectId, VertexWeight};

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("face {face} has {count} vertices")]
    FaceArity { face: usize, count: usize },
    #[error("face {face} references vertex {vertex} but the mesh has {len}")]
    VertexOutOfRange { face: usize, vertex: u32, len: usize },
    #[error("layer '{layer}' has {have} corners, expected {expected}")]
    LayerLength {
        layer: String,
        have: usize,
        expected: usize,
    },
}

/// Bone indices occupy the low 22 bits of a packed skin weight.
pub const BONE_INDEX_MASK: u32 = 0x003F_FFFF;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedFace<const N: usize> {
    pub vertices: [u32; N],
    /// Material slot of the source face.
    pub slot: u16,
}

/// A mesh split and triangulated into the layout of a LOD block.
#[derive(Debug, Clone, Default)]
pub struct PreparedMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<[f32; 2]>,
    pub extra_uvs: Vec<(String, Vec<[f32; 2]>)>,
    pub colors: Vec<(String, Vec<[f32; 3]>)>,
    /// Source vertex of every output vertex.
    pub source_vertices: Vec<u32>,
    /// Vertex group weights, indexed by source vertex.
    pub weights: Vec<Vec<VertexWeight>>,
    pub triangles: Vec<PreparedFace<3>>,
    pub quads: Vec<PreparedFace<4>>,
    pub edge_count: usize,
    /// No UV layer was present; UVs come from a spherical projection.
    pub spherical_uvs: bool,
}

impl PreparedMesh {
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(&self.positions)
    }
}

struct UnionFind(Vec<usize>);

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind((0..n).collect())
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.0[x] != x {
            self.0[x] = self.0[self.0[x]];
            x = self.0[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.0[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// An output polygon. Corners index the source mesh's corner layers.
struct OutFace {
    corners: Vec<usize>,
    source: usize,
}

struct EdgeUse {
    face: usize,
    lo: usize,
    hi: usize,
}

fn edge_key(a: u32, b: u32) -> (u32, u32) {
    (a.min(b), a.max(b))
}

fn corner_angle(p: Vec3, prev: Vec3, next: Vec3) -> f32 {
    let (a, b) = (prev - p, next - p);
    let denom = a.length() * b.length();
    if denom <= 1e-20 {
        return 0.0;
    }
    (a.dot(b) / denom).clamp(-1.0, 1.0).acos()
}

fn min_angle(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    corner_angle(a, c, b)
        .min(corner_angle(b, a, c))
        .min(corner_angle(c, b, a))
}

/// Newell's method; robust for non-planar and concave polygons.
fn polygon_normal(points: &[Vec3]) -> Vec3 {
    let mut n = Vec3::ZERO;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        n.x += (a.y - b.y) * (a.z + b.z);
        n.y += (a.z - b.z) * (a.x + b.x);
        n.z += (a.x - b.x) * (a.y + b.y);
    }
    n.normalize_or_zero()
}

fn cross2(a: Vec2, b: Vec2) -> f32 {
    a.x * b.y - a.y * b.x
}

fn inside_triangle(p: Vec2, a: Vec2, b: Vec2, c: Vec2) -> bool {
    const EPS: f32 = -1e-9;
    cross2(b - a, p - a) >= EPS && cross2(c - b, p - b) >= EPS && cross2(a - c, p - c) >= EPS
}

/// Split a quad along the diagonal that gives the better-shaped triangles.
fn split_quad(corners: &[usize], points: &[Vec3]) -> [[usize; 3]; 2] {
    let [p0, p1, p2, p3] = [points[0], points[1], points[2], points[3]];
    let [c0, c1, c2, c3] = [corners[0], corners[1], corners[2], corners[3]];
    let along_02 = min_angle(p0, p1, p2).min(min_angle(p0, p2, p3));
    let along_13 = min_angle(p0, p1, p3).min(min_angle(p1, p2, p3));
    if along_13 > along_02 {
        [[c0, c1, c3], [c1, c2, c3]]
    } else {
        [[c0, c1, c2], [c0, c2, c3]]
    }
}

/// Ear clipping that always cuts the best-shaped valid ear. Falls back to a
/// fan when no valid ear is left (self-intersecting input).
fn triangulate_ngon(corners: &[usize], points: &[Vec3]) -> Vec<[usize; 3]> {
    let normal = polygon_normal(points);
    let u = normal.any_orthonormal_vector();
    let v = normal.cross(u);
    let flat: Vec<Vec2> = points.iter().map(|p| Vec2::new(p.dot(u), p.dot(v))).collect();

    let mut remaining: Vec<usize> = (0..points.len()).collect();
    let mut triangles = Vec::with_capacity(points.len() - 2);
    while remaining.len() > 3 {
        let m = remaining.len();
        let mut best: Option<(usize, f32)> = None;
        for i in 0..m {
            let (ip, ic, inx) = (remaining[(i + m - 1) % m], remaining[i], remaining[(i + 1) % m]);
            if cross2(flat[ic] - flat[ip], flat[inx] - flat[ic]) <= 1e-12 {
                continue;
            }
            let blocked = remaining.iter().any(|&j| {
                j != ip && j != ic && j != inx && inside_triangle(flat[j], flat[ip], flat[ic], flat[inx])
            });
            if blocked {
                continue;
            }
            let quality = min_angle(points[ip], points[ic], points[inx]);
            if best.is_none_or(|(_, q)| quality > q) {
                best = Some((i, quality));
            }
        }
        let Some((i, _)) = best else {
            for k in 1..m - 1 {
                triangles.push([remaining[0], remaining[k], remaining[k + 1]]);
            }
            remaining.clear();
            break;
        };
        triangles.push([remaining[(i + m - 1) % m], remaining[i], remaining[(i + 1) % m]]);
        remaining.remove(i);
    }
    if remaining.len() == 3 {
        triangles.push([remaining[0], remaining[1], remaining[2]]);
    }
    triangles
        .into_iter()
        .map(|t| t.map(|local| corners[local]))
        .collect()
}

fn spherical_uv(p: Vec3) -> [f32; 2] {
    let r = p.length();
    let theta = (p.y / (1e-20 + r)).clamp(-1.0, 1.0).acos();
    let mut phi = p.z.atan2(p.x);
    if phi < 0.0 {
        phi += TAU;
    }
    [theta / PI, phi / TAU]
}

fn check_layer<T>(name: &str, data: &[T], corners: usize) -> Result<(), Report<GeometryError>> {
    if data.len() < corners {
        return Err(Report::new(GeometryError::LayerLength {
            layer: name.to_string(),
            have: data.len(),
            expected: corners,
        }));
    }
    Ok(())
}

/// Triangulate and split `mesh` into one normal and one UV per vertex.
///
/// Faces with more than four vertices are always triangulated; with
/// `triangulate` set, quads are too.
pub fn prepare(mesh: &Mesh, triangulate: bool) -> Result<PreparedMesh, Report<GeometryError>> {
    let corner_count = mesh.corner_count();
    for (face, f) in mesh.faces.iter().enumerate() {
        if f.vertices.len() < 3 {
            return Err(Report::new(GeometryError::FaceArity {
                face,
                count: f.vertices.len(),
            }));
        }
        if let Some(&vertex) = f.vertices.iter().find(|&&v| v as usize >= mesh.positions.len()) {
            return Err(Report::new(GeometryError::VertexOutOfRange {
                face,
                vertex,
                len: mesh.positions.len(),
            }));
        }
    }
    for layer in &mesh.uv_layers {
        check_layer(&layer.name, &layer.data, corner_count)?;
    }
    for layer in &mesh.color_layers {
        check_layer(&layer.name, &layer.data, corner_count)?;
    }
    if let Some(normals) = &mesh.custom_normals {
        check_layer("custom normals", normals, corner_count)?;
    }

    let starts = mesh.corner_starts();
    let mut corner_vertex = vec![0u32; corner_count];
    let mut corner_face = vec![0usize; corner_count];
    for (fi, face) in mesh.faces.iter().enumerate() {
        for (k, &v) in face.vertices.iter().enumerate() {
            corner_vertex[starts[fi] + k] = v;
            corner_face[starts[fi] + k] = fi;
        }
    }

    // Triangulation. Corners are reused, so no layer data is interpolated.
    let mut out_faces = Vec::with_capacity(mesh.faces.len());
    for (fi, face) in mesh.faces.iter().enumerate() {
        let corners: Vec<usize> = (starts[fi]..starts[fi] + face.vertices.len()).collect();
        let n = corners.len();
        if n == 3 || (n == 4 && !triangulate) {
            out_faces.push(OutFace { corners, source: fi });
            continue;
        }
        let points: Vec<Vec3> = face
            .vertices
            .iter()
            .map(|&v| mesh.positions[v as usize])
            .collect();
        let triangles = if n == 4 {
            split_quad(&corners, &points).to_vec()
        } else {
            triangulate_ngon(&corners, &points)
        };
        out_faces.extend(triangles.into_iter().map(|t| OutFace {
            corners: t.to_vec(),
            source: fi,
        }));
    }

    // Join corners across every shared edge that is not a seam.
    let flags: BTreeMap<(u32, u32), bool> = mesh
        .edges
        .iter()
        .map(|e| (edge_key(e.vertices[0], e.vertices[1]), e.seam || e.sharp))
        .collect();
    let mut uses: BTreeMap<(u32, u32), Vec<EdgeUse>> = BTreeMap::new();
    for (face_index, face) in out_faces.iter().enumerate() {
        let n = face.corners.len();
        for k in 0..n {
            let (ca, cb) = (face.corners[k], face.corners[(k + 1) % n]);
            let (va, vb) = (corner_vertex[ca], corner_vertex[cb]);
            let (lo, hi) = if va <= vb { (ca, cb) } else { (cb, ca) };
            uses.entry(edge_key(va, vb)).or_default().push(EdgeUse {
                face: face_index,
                lo,
                hi,
            });
        }
    }

    let uv0 = mesh.uv_layers.first();
    let uv_differs = |a: usize, b: usize| match uv0 {
        Some(layer) => {
            let (x, y) = (layer.data[a], layer.data[b]);
            (x[0] - y[0]).abs() > 1e-6 || (x[1] - y[1]).abs() > 1e-6
        }
        None => false,
    };
    let mut groups = UnionFind::new(corner_count);
    for (key, edge_uses) in &uses {
        let marked = flags.get(key).copied().unwrap_or(false);
        for (i, a) in edge_uses.iter().enumerate() {
            for b in &edge_uses[i + 1..] {
                let (fa, fb) = (out_faces[a.face].source, out_faces[b.face].source);
                let split = fa != fb
                    && (marked
                        || !mesh.faces[fa].smooth
                        || !mesh.faces[fb].smooth
                        || uv_differs(a.lo, b.lo)
                        || uv_differs(a.hi, b.hi));
                if !split {
                    groups.union(a.lo, b.lo);
                    groups.union(a.hi, b.hi);
                }
            }
        }
    }

    // Output vertices, ordered by source vertex then first corner.
    let mut vertex_corners: Vec<Vec<usize>> = vec![Vec::new(); mesh.positions.len()];
    for face in &out_faces {
        for &c in &face.corners {
            vertex_corners[corner_vertex[c] as usize].push(c);
        }
    }
    let mut corner_out = vec![u32::MAX; corner_count];
    let mut out_groups: Vec<(u32, Vec<usize>)> = Vec::new();
    let mut root_out: BTreeMap<usize, usize> = BTreeMap::new();
    for (v, corners) in vertex_corners.iter_mut().enumerate() {
        corners.sort_unstable();
        corners.dedup();
        if corners.is_empty() {
            out_groups.push((v as u32, Vec::new()));
            continue;
        }
        for &c in corners.iter() {
            let root = groups.find(c);
            let index = *root_out.entry(root).or_insert_with(|| {
                out_groups.push((v as u32, Vec::new()));
                out_groups.len() - 1
            });
            out_groups[index].1.push(c);
        }
    }
    for (index, (_, corners)) in out_groups.iter().enumerate() {
        for &c in corners {
            corner_out[c] = index as u32;
        }
    }

    // Per source face: normal and the angle at each of its corners.
    let mut face_normals = Vec::with_capacity(mesh.faces.len());
    let mut corner_angles = vec![0.0f32; corner_count];
    for (fi, face) in mesh.faces.iter().enumerate() {
        let points: Vec<Vec3> = face
            .vertices
            .iter()
            .map(|&v| mesh.positions[v as usize])
            .collect();
        face_normals.push(polygon_normal(&points));
        let n = points.len();
        for k in 0..n {
            corner_angles[starts[fi] + k] =
                corner_angle(points[k], points[(k + n - 1) % n], points[(k + 1) % n]);
        }
    }

    let spherical_uvs = mesh.uv_layers.is_empty();
    let mut prepared = PreparedMesh {
        spherical_uvs,
        weights: mesh.weights.clone(),
        ..PreparedMesh::default()
    };
    for (v, corners) in &out_groups {
        let position = mesh.positions[*v as usize];
        prepared.positions.push(position);
        prepared.source_vertices.push(*v);
        let first = corners.first().copied();

        let normal = match (first, &mesh.custom_normals) {
            (None, _) => Vec3::ZERO,
            (Some(c), Some(custom)) => custom[c],
            (Some(_), None) => corners
                .iter()
                .map(|&c| face_normals[corner_face[c]] * corner_angles[c])
                .sum::<Vec3>()
                .normalize_or_zero(),
        };
        prepared.normals.push(normal);

        let uv = match (uv0, first) {
            (None, _) => spherical_uv(position),
            (Some(layer), Some(c)) => layer.data[c],
            (Some(_), None) => [0.0, 0.0],
        };
        prepared.uvs.push(uv);
    }
    for layer in mesh.uv_layers.iter().skip(1) {
        let data = out_groups
            .iter()
            .map(|(_, c)| c.first().map_or([0.0, 0.0], |&c| layer.data[c]))
            .collect();
        prepared.extra_uvs.push((layer.name.clone(), data));
    }
    for layer in &mesh.color_layers {
        let data = out_groups
            .iter()
            .map(|(_, c)| c.first().map_or([0.0; 3], |&c| layer.data[c]))
            .collect();
        prepared.colors.push((layer.name.clone(), data));
    }

    let mut face_edges: BTreeSet<(u32, u32)> = BTreeSet::new();
    for face in &out_faces {
        let ids: Vec<u32> = face.corners.iter().map(|&c| corner_out[c]).collect();
        let slot = mesh.faces[face.source].material;
        for k in 0..ids.len() {
            face_edges.insert(edge_key(ids[k], ids[(k + 1) % ids.len()]));
        }
        match ids.as_slice() {
            [a, b, c] => prepared.triangles.push(PreparedFace {
                vertices: [*a, *b, *c],
                slot,
            }),
            [a, b, c, d] => prepared.quads.push(PreparedFace {
                vertices: [*a, *b, *c, *d],
                slot,
            }),
            _ => {
                return Err(Report::new(GeometryError::FaceArity {
                    face: face.source,
                    count: ids.len(),
                }));
            }
        }
    }
    let loose_edges = mesh
        .edges
        .iter()
        .filter(|e| !uses.contains_key(&edge_key(e.vertices[0], e.vertices[1])))
        .count();
    prepared.edge_count = face_edges.len() + loose_edges;
    Ok(prepared)
}

/// How skin weights are resolved for a mesh parented to an armature.
#[derive(Debug, Clone, Copy)]
pub struct SkinBinding<'a> {
    pub armature: ObjectId,
    /// Vertex group names of the mesh object.
    pub groups: &'a [String],
    pub bones: &'a BoneLookup,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    pub deflate: bool,
    pub compress_normals: bool,
}

/// Problems found while resolving the skin weights of one mesh.
#[derive(Debug, Default)]
struct SkinIssues<'a> {
    unknown_groups: BTreeSet<&'a str>,
    bad_index: bool,
    bad_weight: bool,
}

/// Keep the four heaviest influences, heaviest first. Weights outside
/// `[0, 1]` are flagged and clamped before they compete for a slot.
fn top_influences<'a>(
    weights: &[VertexWeight],
    skin: &SkinBinding<'a>,
    issues: &mut SkinIssues<'a>,
) -> ([u32; 4], [f32; 4]) {
    let mut idx = [BONE_INDEX_MASK; 4];
    let mut wts = [0.0f32; 4];
    for vw in weights {
        let bone = skin
            .groups
            .get(vw.group)
            .and_then(|name| skin.bones.get(skin.armature, name));
        let Some(mut b) = bone else {
            issues
                .unknown_groups
                .insert(skin.groups.get(vw.group).map_or("?", String::as_str));
            continue;
        };
        issues.bad_index |= b > BONE_INDEX_MASK;
        if !(0.0..=1.0).contains(&vw.weight) {
            issues.bad_weight = true;
        }
        let mut w = vw.weight.clamp(0.0, 1.0);
        for i in 0..4 {
            if w > wts[i] {
                std::mem::swap(&mut w, &mut wts[i]);
                std::mem::swap(&mut b, &mut idx[i]);
            }
        }
    }
    (idx, wts)
}

pub fn pack_weight(bone: u32, weight: f32) -> u32 {
    let quantized = (weight.clamp(0.0, 1.0) * 1023.0).round() as u32;
    (bone & BONE_INDEX_MASK) | (quantized << 22)
}

fn attribute_block(
    name: &str,
    meta: &str,
    type_code: u32,
    payload: &[u8],
) -> Result<Vec<u8>, Report<FormatError>> {
    let mut block = BinaryBuffer::new();
    block.put_tag(TAG_ATTRIBUTE);
    block.put_string(name)?;
    block.put_string(meta)?;
    block.put_u32(0);
    block.put_u32(type_code);
    block.put_u64(payload.len() as u64);
    block.put_bytes(payload);
    Ok(block.finish())
}

/// Write a mesh LOD block.
///
/// `slot_materials` maps the object's material slots to global material
/// indices; faces whose slot is unmapped use index 0.
pub fn write_mesh_lod(
    buf: &mut BinaryBuffer,
    mesh: &PreparedMesh,
    slot_materials: &[u16],
    skin: Option<SkinBinding<'_>>,
    options: EncodeOptions,
    diagnostics: &mut Diagnostics,
    object: &str,
) -> Result<(), Report<FormatError>> {
    let vertex_count = mesh.positions.len();
    let attribute_count =
        mesh.extra_uvs.len() + mesh.colors.len() + usize::from(skin.is_some());

    buf.put_tag(TAG_LOD);
    buf.put_u32(len_u32("triangle count", mesh.triangles.len())?);
    buf.put_u32(len_u32("quad count", mesh.quads.len())?);
    buf.put_u32(0);
    buf.put_u32(len_u32("vertex count", vertex_count)?);
    buf.put_u32(len_u32("edge count", mesh.edge_count)?);
    buf.put_u32(len_u32("attribute count", attribute_count)?);
    buf.put_u32(0);
    buf.put_u32(0);

    if mesh.spherical_uvs {
        diagnostics.warn(object, "has no uv layers; using a spherical projection");
    }

    let mut vertices = Vec::with_capacity(vertex_count * 32);
    for p in &mesh.positions {
        for c in p.to_array() {
            vertices.put_f32(c);
        }
    }
    for n in &mesh.normals {
        if options.compress_normals {
            vertices.put_u32(encode_octahedral(*n));
        } else {
            for c in n.to_array() {
                vertices.put_f32(c);
            }
        }
    }
    for uv in &mesh.uvs {
        vertices.put_f32(uv[0]);
        vertices.put_f32(uv[1]);
    }
    buf.put_block(&vertices, options.deflate)?;

    for (name, uvs) in &mesh.extra_uvs {
        let mut payload = Vec::with_capacity(uvs.len() * 8);
        for uv in uvs {
            payload.put_f32(uv[0]);
            payload.put_f32(uv[1]);
        }
        let block = attribute_block(name, "AdditionalUV2D", ATTR_TYPE_FLOAT2, &payload)?;
        buf.put_block(&block, options.deflate)?;
    }
    for (name, colors) in &mesh.colors {
        let mut payload = Vec::with_capacity(colors.len() * 12);
        for c in colors.iter().flatten() {
            payload.put_f32(*c);
        }
        let block = attribute_block(name, "Color", ATTR_TYPE_FLOAT3, &payload)?;
        buf.put_block(&block, options.deflate)?;
    }
    if let Some(skin) = skin {
        let mut payload = Vec::with_capacity(vertex_count * 16);
        let mut issues = SkinIssues::default();
        for &source in &mesh.source_vertices {
            let influences = mesh.weights.get(source as usize).map_or(&[][..], Vec::as_slice);
            let (idx, wts) = top_influences(influences, &skin, &mut issues);
            for (b, w) in idx.into_iter().zip(wts) {
                payload.put_u32(pack_weight(b, w));
            }
        }
        for group in issues.unknown_groups {
            diagnostics.warn(
                object,
                format!("vertex group '{group}' is not a bone of the parent armature"),
            );
        }
        if issues.bad_index {
            diagnostics.warn(object, "a vertex references a bone index > 0x003fffff");
        }
        if issues.bad_weight {
            diagnostics.warn(object, "a vertex weight is outside [0,1]");
        }
        let block = attribute_block("AnimationWeights", "", ATTR_TYPE_SKIN_WEIGHTS, &payload)?;
        buf.put_block(&block, options.deflate)?;
    }

    let mut triangles = Vec::with_capacity(mesh.triangles.len() * 12);
    for t in &mesh.triangles {
        t.vertices.iter().for_each(|v| triangles.put_u32(*v));
    }
    buf.put_block(&triangles, options.deflate)?;

    let mut quads = Vec::with_capacity(mesh.quads.len() * 16);
    for q in &mesh.quads {
        q.vertices.iter().for_each(|v| quads.put_u32(*v));
    }
    buf.put_block(&quads, options.deflate)?;

    let material = |slot: u16| slot_materials.get(usize::from(slot)).copied().unwrap_or(0);
    let mut ids = Vec::with_capacity((mesh.triangles.len() + mesh.quads.len()) * 2);
    for t in &mesh.triangles {
        ids.put_u16(material(t.slot));
    }
    for q in &mesh.quads {
        ids.put_u16(material(q.slot));
    }
    buf.put_block(&ids, options.deflate)?;
    Ok(())
}

/// Write a sphere LOD block: center, radius and one material index.
pub fn write_sphere_lod(
    buf: &mut BinaryBuffer,
    bounds: &Aabb,
    material: u16,
    deflate: bool,
) -> Result<(), Report<FormatError>> {
    buf.put_tag(TAG_LOD);
    for count in [0, 0, 1, 0, 0, 0, 0, 0] {
        buf.put_u32(count);
    }
    let center = bounds.center();
    let mut data = Vec::with_capacity(18);
    for c in center.to_array() {
        data.put_f32(c);
    }
    data.put_f32((bounds.min.x - center.x).abs());
    data.put_u16(material);
    buf.put_block(&data, deflate)
}
