//! PKCS#11 module adapter backed by cryptoki
//!
//! Loads a PKCS#11 shared library (SoftHSM2 or a hardware token) and maps its
//! calls onto the [`Module`] contract.

use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use tracing::debug;

use crate::module::{
    KeyAttribute, KeyAttributes, KeyClass, KeyPairTemplate, Module, ModuleError, ModuleSession,
    ObjectQuery,
};

impl From<Error> for ModuleError {
    fn from(e: Error) -> Self {
        match e {
            Error::Pkcs11(RvError::UserAlreadyLoggedIn, ..) => ModuleError::AlreadyLoggedIn,
            Error::Pkcs11(RvError::PinIncorrect, ..) => ModuleError::PinIncorrect,
            Error::Pkcs11(RvError::SessionHandleInvalid | RvError::SessionClosed, ..) => {
                ModuleError::SessionInvalid
            }
            other => ModuleError::Other(other.to_string()),
        }
    }
}

/// A PKCS#11 library loaded through cryptoki.
#[derive(Debug)]
pub struct CryptokiModule {
    ctx: Pkcs11,
}

impl CryptokiModule {
    /// Load the library at `path` and initialize it for multi-threaded use.
    pub fn load(path: &Path) -> Result<Self, ModuleError> {
        let ctx = Pkcs11::new(path)?;
        ctx.initialize(CInitializeArgs::OsThreads)?;
        debug!("Initialized PKCS#11 library {}", path.display());
        Ok(Self { ctx })
    }
}

impl Module for CryptokiModule {
    type Slot = Slot;
    type Session = CryptokiSession;

    fn slots_with_token(&self) -> Result<Vec<Slot>, ModuleError> {
        Ok(self.ctx.get_slots_with_token()?)
    }

    fn token_label(&self, slot: Slot) -> Result<String, ModuleError> {
        let info = self.ctx.get_token_info(slot)?;
        Ok(info.label().to_string())
    }

    fn open_session(&self, slot: Slot, read_write: bool) -> Result<CryptokiSession, ModuleError> {
        let session = if read_write {
            self.ctx.open_rw_session(slot)?
        } else {
            self.ctx.open_ro_session(slot)?
        };
        Ok(CryptokiSession { session })
    }

    fn finalize(self) {
        // C_Finalize runs when the last handle to the library is dropped.
        drop(self.ctx);
    }
}

/// A cryptoki session.
pub struct CryptokiSession {
    session: Session,
}

fn class_of(class: KeyClass) -> ObjectClass {
    match class {
        KeyClass::PublicKey => ObjectClass::PUBLIC_KEY,
        KeyClass::PrivateKey => ObjectClass::PRIVATE_KEY,
    }
}

impl ModuleSession for CryptokiSession {
    type Object = ObjectHandle;

    fn login(&self, pin: &AuthPin) -> Result<(), ModuleError> {
        Ok(self.session.login(UserType::User, Some(pin))?)
    }

    fn logout(&self) -> Result<(), ModuleError> {
        Ok(self.session.logout()?)
    }

    fn close(self) -> Result<(), ModuleError> {
        // cryptoki closes the session on drop and reports failures itself.
        drop(self.session);
        Ok(())
    }

    fn find_objects(&self, query: &ObjectQuery) -> Result<Vec<ObjectHandle>, ModuleError> {
        let mut template = vec![Attribute::Class(class_of(query.class))];
        if let Some(id) = &query.id {
            template.push(Attribute::Id(id.clone()));
        }
        // cryptoki drives C_FindObjects in fixed-size batches until exhausted.
        Ok(self.session.find_objects(&template)?)
    }

    fn read_attributes(
        &self,
        object: ObjectHandle,
        attributes: &[KeyAttribute],
    ) -> Result<KeyAttributes, ModuleError> {
        let types: Vec<AttributeType> = attributes
            .iter()
            .map(|attr| match attr {
                KeyAttribute::Id => AttributeType::Id,
                KeyAttribute::Label => AttributeType::Label,
                KeyAttribute::EcPoint => AttributeType::EcPoint,
            })
            .collect();

        let mut values = KeyAttributes::default();
        for attr in self.session.get_attributes(object, &types)? {
            match attr {
                Attribute::Id(id) => values.id = Some(id),
                Attribute::Label(label) => {
                    values.label = Some(String::from_utf8_lossy(&label).into_owned())
                }
                Attribute::EcPoint(point) => values.ec_point = Some(point),
                _ => {}
            }
        }
        Ok(values)
    }

    fn generate_key_pair(
        &self,
        template: &KeyPairTemplate,
    ) -> Result<(ObjectHandle, ObjectHandle), ModuleError> {
        let label = template.label.as_bytes().to_vec();

        let pub_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::EcParams(template.ec_params.clone()),
            Attribute::Label(label.clone()),
            Attribute::Id(template.id.clone()),
        ];

        let priv_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(label),
            Attribute::Id(template.id.clone()),
        ];

        Ok(self
            .session
            .generate_key_pair(&Mechanism::EccKeyPairGen, &pub_template, &priv_template)?)
    }

    fn sign(&self, key: ObjectHandle, digest: &[u8]) -> Result<Vec<u8>, ModuleError> {
        Ok(self.session.sign(&Mechanism::Ecdsa, key, digest)?)
    }

    fn destroy_object(&self, object: ObjectHandle) -> Result<(), ModuleError> {
        Ok(self.session.destroy_object(object)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_library_fails() {
        let result = CryptokiModule::load(Path::new("/nonexistent/libpkcs11-missing.so"));
        assert!(matches!(result, Err(ModuleError::Other(_))));
    }

    #[test]
    fn test_class_mapping() {
        assert_eq!(class_of(KeyClass::PublicKey), ObjectClass::PUBLIC_KEY);
        assert_eq!(class_of(KeyClass::PrivateKey), ObjectClass::PRIVATE_KEY);
    }
}
