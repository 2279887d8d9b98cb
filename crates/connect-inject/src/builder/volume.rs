use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, SecretVolumeSource, Volume, VolumeMount};

/// A builder to build [`Volume`] objects. May only contain one `volume_source`
/// at a time. E.g. a call like `with_secret` after `empty_dir` will overwrite the
/// `empty_dir`.
#[derive(Clone, Debug, Default)]
pub struct VolumeBuilder {
    name: String,
    volume_source: VolumeSource,
}

#[derive(Clone, Debug)]
pub enum VolumeSource {
    EmptyDir(EmptyDirVolumeSource),
    Secret(SecretVolumeSource),
}

impl Default for VolumeSource {
    fn default() -> Self {
        Self::EmptyDir(EmptyDirVolumeSource::default())
    }
}

impl VolumeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn empty_dir(&mut self, empty_dir: impl Into<EmptyDirVolumeSource>) -> &mut Self {
        self.volume_source = VolumeSource::EmptyDir(empty_dir.into());
        self
    }

    pub fn with_secret(&mut self, secret_name: impl Into<String>, optional: bool) -> &mut Self {
        self.volume_source = VolumeSource::Secret(SecretVolumeSource {
            optional: Some(optional),
            secret_name: Some(secret_name.into()),
            ..SecretVolumeSource::default()
        });
        self
    }

    pub fn build(&self) -> Volume {
        let name = self.name.clone();
        match &self.volume_source {
            VolumeSource::EmptyDir(empty_dir) => Volume {
                name,
                empty_dir: Some(empty_dir.clone()),
                ..Volume::default()
            },
            VolumeSource::Secret(secret) => Volume {
                name,
                secret: Some(secret.clone()),
                ..Volume::default()
            },
        }
    }
}

/// A builder to build [`VolumeMount`] objects.
#[derive(Clone, Debug, Default)]
pub struct VolumeMountBuilder {
    name: String,
    mount_path: String,
    read_only: Option<bool>,
}

impl VolumeMountBuilder {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            ..Self::default()
        }
    }

    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn build(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_path.clone(),
            read_only: self.read_only,
            ..VolumeMount::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let mut volume_builder = VolumeBuilder::new("data");
        let volume = volume_builder.build();

        assert_eq!(volume.name, "data");
        assert_eq!(volume.empty_dir, Some(EmptyDirVolumeSource::default()));

        volume_builder.with_secret("consul-ca", false);
        let volume = volume_builder.build();

        assert_eq!(volume.empty_dir, None);
        assert_eq!(
            volume.secret.and_then(|secret| secret.secret_name),
            Some("consul-ca".to_owned())
        );
    }

    #[test]
    fn mount_builder() {
        let volume_mount = VolumeMountBuilder::new("tls-ca-cert", "/consul/tls/ca")
            .read_only(true)
            .build();

        assert_eq!(volume_mount.name, "tls-ca-cert");
        assert_eq!(volume_mount.mount_path, "/consul/tls/ca");
        assert_eq!(volume_mount.read_only, Some(true));
    }
}
