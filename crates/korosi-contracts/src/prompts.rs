use crate::prediction::{format_confidence, Label};

pub const MISSING_API_KEY_MESSAGE: &str = "Warning: Gemini API key not found. Set GEMINI_API_KEY in the environment (or your deployment secrets) to enable AI analysis.";

pub const REPORT_ERROR_PREFIX: &str = "Error during AI analysis";

const CORROSION_TEMPLATE: &str = "You are a materials and corrosion expert. This image has been classified as containing CORROSION with a confidence of {confidence}.

Perform an in-depth visual analysis and provide a structured report covering:

1. **Discoloration Detection**:
   - Identify areas with abnormal color changes
   - Describe the colors visible (red/brown/green/white)
   - Interpret the likely type of corrosion from the colors

2. **Corrosion Product Identification**:
   - Type of corrosion products visible (rust, scale, deposits)
   - Location and distribution of the corrosion products
   - Estimate of the corroded material

3. **Pitting Corrosion**:
   - Presence or absence of small pits on the surface
   - Severity of pitting if present
   - Most affected areas

4. **Protective Coating Damage**:
   - Condition of the coating/paint on the surface
   - Areas with peeling or cracking
   - Degree of base metal exposure

5. **Deformation and Structural Damage**:
   - Visible changes in physical shape
   - Bulges, dents or other deformation
   - Potential impact on structural integrity

6. **Recommended Actions**:
   - Remediation urgency (Low/Medium/High/Critical)
   - Suggested remediation steps
   - Prevention methods for the future

Provide a detailed, professional and easy to understand analysis.";

const NO_CORROSION_TEMPLATE: &str = "You are a materials and corrosion expert. This image has been classified as NOT containing corrosion with a confidence of {confidence}.

Perform a visual verification and provide a report covering:

1. **Surface Condition**:
   - General description of the surface condition
   - Visible colors and texture
   - Presence or absence of early signs of degradation

2. **Protective Coating Assessment**:
   - Condition of the coating/paint if present
   - Integrity of the protective layer
   - Areas that need special attention

3. **Risk Factors**:
   - Areas potentially vulnerable to corrosion
   - Environmental factors to watch
   - Early warning signs if any

4. **Maintenance Recommendations**:
   - Preventive maintenance suggestions
   - Recommended inspection frequency
   - Additional protective measures

Provide an objective and constructive analysis.";

pub fn template_for(label: Label) -> &'static str {
    match label {
        Label::Corrosion => CORROSION_TEMPLATE,
        Label::NoCorrosion => NO_CORROSION_TEMPLATE,
    }
}

pub fn build_report_prompt(label: Label, confidence_percent: f64) -> String {
    template_for(label).replace("{confidence}", &format_confidence(confidence_percent))
}

pub fn report_error_message(detail: &str) -> String {
    format!("{REPORT_ERROR_PREFIX}: {}", detail.trim())
}

pub fn report_file_name(image_file_name: &str) -> String {
    let cleaned: String = image_file_name
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    let stem = if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    };
    format!("corrosion_analysis_report_{stem}.txt")
}
