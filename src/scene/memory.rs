use std::collections::BTreeMap;

use glam::Mat4;
use rootcause::Report;

use super::{
    BonePose, Frame, MaterialData, MaterialId, Mesh, MeshId, MeshRef, Object, ObjectId,
    ObjectKind, SceneError, SceneInfo, SceneSource,
};

/// Owned scene graph held entirely in memory.
///
/// Transforms and meshes may be keyed per frame. Lookups fall back to the
/// static value when no per-frame entry exists.
#[derive(Debug, Clone)]
pub struct MemoryScene {
    pub objects: Vec<Object>,
    pub materials: Vec<MaterialData>,
    pub scenes: Vec<SceneInfo>,
    pub active_scene: usize,
    pub clip: (f32, f32),
    meshes: BTreeMap<MeshId, Mesh>,
    transforms: Vec<Mat4>,
    animated_transforms: BTreeMap<(ObjectId, Frame), Mat4>,
    animated_meshes: BTreeMap<(ObjectId, Frame), Mesh>,
    bone_poses: BTreeMap<(ObjectId, usize, Frame), BonePose>,
}

impl MemoryScene {
    pub fn new(scene_name: impl Into<String>) -> Self {
        MemoryScene {
            objects: Vec::new(),
            materials: Vec::new(),
            scenes: vec![SceneInfo {
                name: scene_name.into(),
                frame_start: 1,
                frame_end: 1,
                frame_current: 1,
                resolution: [1920, 1080],
                camera: None,
                world: None,
                objects: Vec::new(),
            }],
            active_scene: 0,
            clip: (0.1, 1000.0),
            meshes: BTreeMap::new(),
            transforms: Vec::new(),
            animated_transforms: BTreeMap::new(),
            animated_meshes: BTreeMap::new(),
            bone_poses: BTreeMap::new(),
        }
    }

    pub fn active(&self) -> &SceneInfo {
        &self.scenes[self.active_scene]
    }

    pub fn active_mut(&mut self) -> &mut SceneInfo {
        &mut self.scenes[self.active_scene]
    }

    pub fn add_material(&mut self, material: MaterialData) -> MaterialId {
        self.materials.push(material);
        MaterialId(self.materials.len() - 1)
    }

    /// Register mesh data under a fresh id. Several objects may share it.
    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        let id = MeshId(self.meshes.len());
        self.meshes.insert(id, mesh);
        id
    }

    pub fn mesh_ref(&self, id: MeshId, name: impl Into<String>) -> MeshRef {
        MeshRef {
            id,
            name: name.into(),
            faces: self.meshes.get(&id).map_or(0, |m| m.faces.len()),
        }
    }

    /// Add an object to the active scene with a static world transform.
    pub fn add_object(&mut self, object: Object, world: Mat4) -> ObjectId {
        self.objects.push(object);
        self.transforms.push(world);
        let id = ObjectId(self.objects.len() - 1);
        self.active_mut().objects.push(id);
        id
    }

    /// Add a mesh object with its own mesh datablock.
    pub fn add_mesh_object(
        &mut self,
        name: &str,
        mesh: Mesh,
        slots: Vec<Option<MaterialId>>,
        world: Mat4,
    ) -> ObjectId {
        let id = self.add_mesh(mesh);
        let mesh_ref = self.mesh_ref(id, name);
        let mut object = Object::new(name, ObjectKind::Mesh(mesh_ref));
        object.material_slots = slots;
        self.add_object(object, world)
    }

    pub fn set_transform_at(&mut self, object: ObjectId, frame: Frame, world: Mat4) {
        self.animated_transforms.insert((object, frame), world);
    }

    pub fn set_mesh_at(&mut self, object: ObjectId, frame: Frame, mesh: Mesh) {
        self.animated_meshes.insert((object, frame), mesh);
    }

    pub fn set_bone_pose(&mut self, armature: ObjectId, bone: usize, frame: Frame, pose: BonePose) {
        self.bone_poses.insert((armature, bone, frame), pose);
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.objects[id.0]
    }
}

impl SceneSource for MemoryScene {
    fn objects(&self) -> &[Object] {
        &self.objects
    }

    fn materials(&self) -> &[MaterialData] {
        &self.materials
    }

    fn scenes(&self) -> &[SceneInfo] {
        &self.scenes
    }

    fn active_scene(&self) -> usize {
        self.active_scene
    }

    fn world_matrix(&self, object: ObjectId, frame: Frame) -> Result<Mat4, Report<SceneError>> {
        if let Some(m) = self.animated_transforms.get(&(object, frame)) {
            return Ok(*m);
        }
        self.transforms
            .get(object.0)
            .copied()
            .ok_or_else(|| Report::new(SceneError::NoSuchObject(object)))
    }

    fn evaluated_mesh(
        &self,
        object: ObjectId,
        frame: Frame,
        _rest_pose: bool,
    ) -> Result<Mesh, Report<SceneError>> {
        if let Some(mesh) = self.animated_meshes.get(&(object, frame)) {
            return Ok(mesh.clone());
        }
        let obj = self
            .objects
            .get(object.0)
            .ok_or_else(|| Report::new(SceneError::NoSuchObject(object)))?;
        let ObjectKind::Mesh(mesh_ref) = &obj.kind else {
            return Err(Report::new(SceneError::NotAMesh(obj.name.clone())));
        };
        self.meshes
            .get(&mesh_ref.id)
            .cloned()
            .ok_or_else(|| Report::new(SceneError::NotAMesh(obj.name.clone())))
    }

    fn bone_pose(
        &self,
        armature: ObjectId,
        bone: usize,
        frame: Frame,
    ) -> Result<BonePose, Report<SceneError>> {
        if let Some(pose) = self.bone_poses.get(&(armature, bone, frame)) {
            return Ok(*pose);
        }
        let obj = self
            .objects
            .get(armature.0)
            .ok_or_else(|| Report::new(SceneError::NoSuchObject(armature)))?;
        match &obj.kind {
            ObjectKind::Armature(arm) if bone < arm.bones.len() => Ok(BonePose {
                rest: Mat4::IDENTITY,
                pose: Mat4::IDENTITY,
            }),
            _ => Err(Report::new(SceneError::NoSuchBone {
                armature: obj.name.clone(),
                bone,
            })),
        }
    }

    fn viewport_clip(&self) -> (f32, f32) {
        self.clip
    }
}
