//! Typed mutation payloads, one variant per synced entity.
//!
//! The field app historically merged loose JSON objects per form section;
//! here every entity carries an explicit struct so the payload contract the
//! remote receives is statically checkable. Attachments travel embedded as
//! `data:` URLs until the flush pass uploads them and rewrites the reference
//! to the final storage URL.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::EntityType;

/// Geofence annotation attached at capture time when the record's
/// coordinates fall inside a mapped risk area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskTag {
    pub source: String,
    pub name: String,
    pub risk_level: String,
    #[serde(default)]
    pub description: String,
}

/// One photo or scanned document. `data` is either a `data:*;base64,` URL
/// captured offline or an https URL once uploaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Foto {
    pub id: String,
    pub data: String,
    #[serde(default)]
    pub legenda: Option<String>,
}

impl Foto {
    pub fn is_data_url(&self) -> bool {
        self.data.starts_with("data:")
    }

    /// Decode an embedded `data:<content-type>;base64,<payload>` URL.
    /// Returns None for plain URLs or malformed data URLs.
    pub fn decode_data_url(&self) -> Option<(Vec<u8>, String)> {
        let rest = self.data.strip_prefix("data:")?;
        let (content_type, b64) = rest.split_once(";base64,")?;
        let bytes = BASE64.decode(b64).ok()?;
        let content_type = if content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            content_type.to_string()
        };
        Some((bytes, content_type))
    }

    /// File extension used for the storage object name.
    pub fn extension(&self) -> &'static str {
        let ct = self
            .data
            .strip_prefix("data:")
            .and_then(|r| r.split(';').next())
            .unwrap_or("");
        match ct {
            "image/png" => "png",
            "image/gif" => "gif",
            "application/pdf" => "pdf",
            _ => "jpg",
        }
    }
}

/// Field inspection of a hazard/risk site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VistoriaPayload {
    pub processo: Option<String>,
    pub agente: Option<String>,
    pub matricula: Option<String>,
    pub solicitante: Option<String>,
    pub cpf: Option<String>,
    pub telefone: Option<String>,
    pub endereco: Option<String>,
    pub bairro: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub data_hora: Option<String>,
    pub tipo_info: Option<String>,
    pub observacoes: Option<String>,
    #[serde(default)]
    pub fotos: Vec<Foto>,
    #[serde(default)]
    pub documentos: Vec<Foto>,
    pub risco: Option<RiskTag>,
}

/// Formal order restricting use of an unsafe structure or area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InterdicaoPayload {
    pub data_hora: Option<String>,
    pub municipio: Option<String>,
    pub bairro: Option<String>,
    pub endereco: Option<String>,
    pub tipo_alvo: Option<String>,
    pub tipo_alvo_especificar: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub responsavel_nome: Option<String>,
    pub responsavel_cpf: Option<String>,
    pub responsavel_telefone: Option<String>,
    pub responsavel_email: Option<String>,
    pub risco_tipo: Option<String>,
    pub risco_grau: Option<String>,
    pub situacao_observada: Option<String>,
    pub medida_tipo: Option<String>,
    pub medida_prazo: Option<String>,
    pub medida_prazo_data: Option<String>,
    pub evacuacao_necessaria: Option<bool>,
    #[serde(default)]
    pub fotos: Vec<Foto>,
    pub relatorio_tecnico: Option<String>,
    pub recomendacoes: Option<String>,
    #[serde(default)]
    pub orgaos_acionados: Vec<String>,
    pub risco: Option<RiskTag>,
}

/// Emergency procurement contract record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContratoPayload {
    pub numero: Option<String>,
    pub objeto: Option<String>,
    pub contratada: Option<String>,
    pub cnpj: Option<String>,
    pub valor: Option<f64>,
    pub data_inicio: Option<String>,
    pub data_fim: Option<String>,
    pub observacoes: Option<String>,
    #[serde(default)]
    pub documentos: Vec<Foto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum MutationPayload {
    Vistoria(VistoriaPayload),
    Interdicao(InterdicaoPayload),
    Contrato(ContratoPayload),
}

impl MutationPayload {
    pub fn entity(&self) -> EntityType {
        match self {
            MutationPayload::Vistoria(_) => EntityType::Vistoria,
            MutationPayload::Interdicao(_) => EntityType::Interdicao,
            MutationPayload::Contrato(_) => EntityType::Contrato,
        }
    }

    /// Coordinates used for geofencing at capture time, if the form has them.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match self {
            MutationPayload::Vistoria(v) => Some((v.lat?, v.lon?)),
            MutationPayload::Interdicao(i) => Some((i.latitude?, i.longitude?)),
            MutationPayload::Contrato(_) => None,
        }
    }

    /// Attach (or clear) the risk-area annotation. No-op for contracts,
    /// which carry no location.
    pub fn set_risk_tag(&mut self, tag: Option<RiskTag>) {
        match self {
            MutationPayload::Vistoria(v) => v.risco = tag,
            MutationPayload::Interdicao(i) => i.risco = tag,
            MutationPayload::Contrato(_) => {}
        }
    }

    /// The attachments the flush pass must upload before the row upsert.
    pub fn attachments_mut(&mut self) -> &mut Vec<Foto> {
        match self {
            MutationPayload::Vistoria(v) => &mut v.fotos,
            MutationPayload::Interdicao(i) => &mut i.fotos,
            MutationPayload::Contrato(c) => &mut c.documentos,
        }
    }

    pub fn attachments(&self) -> &[Foto] {
        match self {
            MutationPayload::Vistoria(v) => &v.fotos,
            MutationPayload::Interdicao(i) => &i.fotos,
            MutationPayload::Contrato(c) => &c.documentos,
        }
    }

    /// Build the JSON row sent to the remote table, keyed by the stable
    /// record id so retried upserts land on the same row.
    pub fn to_remote_row(&self, record_id: &str) -> Value {
        let mut row = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                // The tag names the local variant; the remote table is already
                // entity-specific.
                map.remove("entity");
                Value::Object(map)
            }
            other => other.unwrap_or(Value::Null),
        };
        if let Value::Object(map) = &mut row {
            map.insert(
                self.entity().remote_key().to_string(),
                json!(record_id),
            );
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vistoria() -> MutationPayload {
        MutationPayload::Vistoria(VistoriaPayload {
            processo: Some("2026/001".into()),
            agente: Some("J. Silva".into()),
            bairro: Some("Centro".into()),
            lat: Some(-20.024),
            lon: Some(-40.746),
            fotos: vec![Foto {
                id: "f1".into(),
                data: "data:image/jpeg;base64,aGVsbG8=".into(),
                legenda: None,
            }],
            ..Default::default()
        })
    }

    #[test]
    fn tagged_serialization_round_trips() {
        let p = sample_vistoria();
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["entity"], "vistoria");
        assert_eq!(v["bairro"], "Centro");
        let back: MutationPayload = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn remote_row_carries_stable_key_and_drops_tag() {
        let row = sample_vistoria().to_remote_row("abc-123");
        assert_eq!(row["vistoria_id"], "abc-123");
        assert!(row.get("entity").is_none());
        assert_eq!(row["lat"], -20.024);

        let row = MutationPayload::Contrato(ContratoPayload {
            numero: Some("CT-7".into()),
            ..Default::default()
        })
        .to_remote_row("c-1");
        assert_eq!(row["contrato_id"], "c-1");
        assert_eq!(row["numero"], "CT-7");
    }

    #[test]
    fn coordinates_per_entity() {
        assert_eq!(sample_vistoria().coordinates(), Some((-20.024, -40.746)));
        let i = MutationPayload::Interdicao(InterdicaoPayload {
            latitude: Some(-19.9),
            longitude: Some(-40.7),
            ..Default::default()
        });
        assert_eq!(i.coordinates(), Some((-19.9, -40.7)));
        let c = MutationPayload::Contrato(ContratoPayload::default());
        assert_eq!(c.coordinates(), None);
        let partial = MutationPayload::Vistoria(VistoriaPayload {
            lat: Some(-20.0),
            ..Default::default()
        });
        assert_eq!(partial.coordinates(), None);
    }

    #[test]
    fn decode_data_url() {
        let foto = Foto {
            id: "f1".into(),
            data: "data:image/png;base64,aGVsbG8=".into(),
            legenda: None,
        };
        let (bytes, ct) = foto.decode_data_url().unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(ct, "image/png");
        assert_eq!(foto.extension(), "png");

        let plain = Foto {
            id: "f2".into(),
            data: "https://cdn.example/f2.jpg".into(),
            legenda: None,
        };
        assert!(!plain.is_data_url());
        assert!(plain.decode_data_url().is_none());
        assert_eq!(plain.extension(), "jpg");
    }

    #[test]
    fn risk_tag_attach() {
        let mut p = sample_vistoria();
        p.set_risk_tag(Some(RiskTag {
            source: "SEDURB (Municipal)".into(),
            name: "Vila de Jetibá".into(),
            risk_level: "R3".into(),
            description: String::new(),
        }));
        let row = p.to_remote_row("v-1");
        assert_eq!(row["risco"]["name"], "Vila de Jetibá");

        let mut c = MutationPayload::Contrato(ContratoPayload::default());
        c.set_risk_tag(Some(RiskTag {
            source: "x".into(),
            name: "y".into(),
            risk_level: "z".into(),
            description: String::new(),
        }));
        assert!(c.to_remote_row("c-1").get("risco").is_none());
    }
}
